//! A functional software model of the device.
//!
//! [`MockDeviceApi`] implements [`DeviceApi`] entirely in memory: every DRAM
//! or scratch buffer is a plain `Vec<f64>`. Real host SDKs only ever see the
//! opaque kernel source text `kernel_register` hands them — compiling and
//! running that text is out of scope here, same as for a real device.
//! Instead `MockDeviceApi` uses [`DeviceApi::observe_buffer`]
//! and [`DeviceApi::observe_kernel_ir`] (no-ops for a real backend) to keep
//! the structured [`KernelIr`] alongside the text, and `finish()` interprets
//! that IR directly. This is what lets the rest of the crate be exercised
//! end to end in ordinary tests without a real accelerator.

use std::collections::HashMap;

use crate::device::{
    BufferDesc, BufferHandle, BufferTier, CbHandle, DeviceApi, DeviceConfig, KernelHandle,
    Processor,
};
use crate::error::DeviceError;
use crate::format::{DataFormat, TILE_SIZE};
use crate::graph::{CoreCoord, DramOwner, DramRole};
use crate::synth::{ComputeIr, ComputeOp, InputKind, KernelIr, ReaderInput, WriterOutput};

fn call_err(call: &str, detail: impl Into<String>) -> DeviceError {
    DeviceError::Call {
        call: call.to_string(),
        detail: detail.into(),
    }
}

#[derive(Debug, Clone, Default)]
struct MockBuffer {
    data: Vec<f64>,
}

/// An in-memory stand-in for the host SDK. Buffers, scratch,
/// and kernel registration are all tracked so a `Map` can be validated,
/// compiled, executed, and read back against this device exactly as it
/// would be against a real one.
pub struct MockDeviceApi {
    config: DeviceConfig,
    next_buffer: u32,
    next_cb: u32,
    next_kernel: u32,
    buffers: HashMap<BufferHandle, MockBuffer>,
    owners: HashMap<(DramOwner, DramRole), BufferHandle>,
    scratch: HashMap<(CoreCoord, usize), Vec<f64>>,
    kernel_ir: HashMap<CoreCoord, KernelIr>,
}

impl MockDeviceApi {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            next_buffer: 0,
            next_cb: 0,
            next_kernel: 0,
            buffers: HashMap::new(),
            owners: HashMap::new(),
            scratch: HashMap::new(),
            kernel_ir: HashMap::new(),
        }
    }

    fn buffer_for(&self, owner: DramOwner, role: DramRole) -> Result<&MockBuffer, DeviceError> {
        let handle = self
            .owners
            .get(&(owner, role))
            .ok_or_else(|| call_err("finish", format!("no buffer for {:?}/{:?}", owner, role)))?;
        Ok(self
            .buffers
            .get(handle)
            .expect("a recorded owner always has a live buffer"))
    }

    fn slice_or_pad(buf: &[f64], start: usize, len: usize) -> Vec<f64> {
        (0..len).map(|i| buf.get(start + i).copied().unwrap_or(0.0)).collect()
    }

    /// Reads the `accesses_per_token`-strided index positions this input's
    /// access slot owns for each of `out_len` output tokens starting at this
    /// core's slice offset. Token `i`'s raw lookups live at
    /// `i * accesses_per_token .. i * accesses_per_token + accesses_per_token`
    /// in the gather stream's index buffer, and this input reads the one at
    /// `access_slot` within that group — see [`crate::graph::Edge::access_slot`].
    fn gathered_indices(idx: &MockBuffer, tile_start: u64, out_len: usize, accesses_per_token: u64, access_slot: u64) -> Vec<u32> {
        let token_start = tile_start * TILE_SIZE;
        (0..out_len)
            .map(|i| {
                let pos = (token_start + i as u64) * accesses_per_token + access_slot;
                idx.data.get(pos as usize).copied().unwrap_or(0.0) as u32
            })
            .collect()
    }

    /// Resolves one reader input's values directly from the buffers it was
    /// uploaded to, following the same Plain/GatherDram/GatherScratch
    /// distinction the synthesized reader source encodes.
    fn read_input(
        &self,
        core: CoreCoord,
        input: &ReaderInput,
        out_len: usize,
    ) -> Result<Vec<f64>, DeviceError> {
        let start = (input.tile_start * TILE_SIZE) as usize;
        match input.kind {
            InputKind::Plain => {
                let buf = self.buffer_for(input.owner, DramRole::Data)?;
                Ok(Self::slice_or_pad(&buf.data, start, out_len))
            }
            InputKind::GatherDram { accesses_per_token, .. } => {
                let DramOwner::Stream(sid) = input.owner else {
                    return Err(call_err("finish", "gather input owner must be a stream"));
                };
                let idx = self.buffer_for(DramOwner::Stream(sid), DramRole::Index)?;
                let data = self.buffer_for(DramOwner::Stream(sid), DramRole::Data)?;
                let indices = Self::gathered_indices(idx, input.tile_start, out_len, accesses_per_token, input.access_slot);
                Ok(indices
                    .into_iter()
                    .map(|v| data.data.get(v as usize).copied().unwrap_or(0.0))
                    .collect())
            }
            InputKind::GatherScratch { scratch_base, accesses_per_token, .. } => {
                let DramOwner::Stream(sid) = input.owner else {
                    return Err(call_err("finish", "gather input owner must be a stream"));
                };
                let idx = self.buffer_for(DramOwner::Stream(sid), DramRole::Index)?;
                let indices = Self::gathered_indices(idx, input.tile_start, out_len, accesses_per_token, input.access_slot);
                let data = self.scratch.get(&(core, scratch_base)).ok_or_else(|| {
                    call_err("finish", "no scratch data broadcast for this gather input")
                })?;
                Ok(indices
                    .into_iter()
                    .map(|v| data.get(v as usize).copied().unwrap_or(0.0))
                    .collect())
            }
        }
    }

    fn write_output(&mut self, output: &WriterOutput, values: &[f64]) -> Result<(), DeviceError> {
        let handle = *self
            .owners
            .get(&(output.owner, DramRole::Data))
            .ok_or_else(|| call_err("finish", "no buffer for writer output"))?;
        let buf = self
            .buffers
            .get_mut(&handle)
            .expect("a recorded owner always has a live buffer");
        let start = (output.tile_start * TILE_SIZE) as usize;
        let end = start + values.len();
        if buf.data.len() < end {
            buf.data.resize(end, 0.0);
        }
        buf.data[start..end].copy_from_slice(values);
        Ok(())
    }

    /// Evaluates the lowered stack machine elementwise across `out_len`
    /// positions. Mirrors [`crate::expr::eval`]'s semantics exactly, since
    /// `ops` is just [`crate::synth`]'s flattening of the same `Ast`.
    fn run_compute(ir: &ComputeIr, inputs: &HashMap<String, Vec<f64>>, out_len: usize) -> HashMap<String, Vec<f64>> {
        let mut outputs: HashMap<String, Vec<f64>> = ir
            .output_cbs
            .iter()
            .map(|(name, _)| (name.clone(), vec![0.0; out_len]))
            .collect();

        for i in 0..out_len {
            let mut stack: Vec<f64> = Vec::new();
            for op in &ir.ops {
                match op {
                    ComputeOp::LoadInput(name) => {
                        stack.push(inputs.get(name).and_then(|v| v.get(i)).copied().unwrap_or(0.0))
                    }
                    ComputeOp::LoadConst(bits) => stack.push(f64::from_bits(*bits)),
                    ComputeOp::Add => {
                        let b = stack.pop().unwrap_or(0.0);
                        let a = stack.pop().unwrap_or(0.0);
                        stack.push(a + b);
                    }
                    ComputeOp::Sub => {
                        let b = stack.pop().unwrap_or(0.0);
                        let a = stack.pop().unwrap_or(0.0);
                        stack.push(a - b);
                    }
                    ComputeOp::Mul => {
                        let b = stack.pop().unwrap_or(0.0);
                        let a = stack.pop().unwrap_or(0.0);
                        stack.push(a * b);
                    }
                    ComputeOp::Div => {
                        let b = stack.pop().unwrap_or(0.0);
                        let a = stack.pop().unwrap_or(0.0);
                        stack.push(a / b);
                    }
                    ComputeOp::Neg => {
                        let a = stack.pop().unwrap_or(0.0);
                        stack.push(-a);
                    }
                    ComputeOp::StoreOutput(name) => {
                        let v = stack.pop().unwrap_or(0.0);
                        if let Some(slot) = outputs.get_mut(name) {
                            slot[i] = v;
                        }
                    }
                }
            }
        }
        outputs
    }
}

impl Default for MockDeviceApi {
    fn default() -> Self {
        Self::new(DeviceConfig::default())
    }
}

impl DeviceApi for MockDeviceApi {
    fn scratch_capacity_per_core(&self) -> usize {
        self.config.scratch_capacity_per_core
    }

    fn scratch_reserved_base(&self) -> usize {
        self.config.scratch_reserved_base
    }

    fn program_create(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn buffer_create(&mut self, _desc: BufferDesc) -> Result<BufferHandle, DeviceError> {
        let handle = BufferHandle(self.next_buffer);
        self.next_buffer += 1;
        self.buffers.insert(handle, MockBuffer::default());
        Ok(handle)
    }

    fn buffer_release(&mut self, handle: BufferHandle) -> Result<(), DeviceError> {
        self.buffers.remove(&handle);
        Ok(())
    }

    fn buffer_address(&self, handle: BufferHandle) -> u64 {
        handle.0 as u64 * 0x1_0000
    }

    fn buffer_noc_coords(&self, handle: BufferHandle) -> (u32, u32) {
        (handle.0 % 8, handle.0 / 8)
    }

    fn circular_buffer_create(
        &mut self,
        _core: CoreCoord,
        _id: u32,
        _capacity: u64,
        _page_size: u64,
        _format: DataFormat,
    ) -> Result<CbHandle, DeviceError> {
        let handle = CbHandle(self.next_cb);
        self.next_cb += 1;
        Ok(handle)
    }

    fn circular_buffer_release(&mut self, _handle: CbHandle) -> Result<(), DeviceError> {
        Ok(())
    }

    fn kernel_register(
        &mut self,
        _core: CoreCoord,
        _processor: Processor,
        _source: String,
    ) -> Result<KernelHandle, DeviceError> {
        let handle = KernelHandle(self.next_kernel);
        self.next_kernel += 1;
        Ok(handle)
    }

    fn set_runtime_args(
        &mut self,
        _kernel: KernelHandle,
        _core: CoreCoord,
        _args: Vec<u32>,
    ) -> Result<(), DeviceError> {
        Ok(())
    }

    fn enqueue_write_buffer(
        &mut self,
        buffer: BufferHandle,
        host_data: &[f64],
        _format: DataFormat,
    ) -> Result<(), DeviceError> {
        let buf = self
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| call_err("enqueue_write_buffer", "unknown buffer handle"))?;
        buf.data = host_data.to_vec();
        Ok(())
    }

    fn enqueue_read_buffer(
        &mut self,
        buffer: BufferHandle,
        element_count: u64,
        _format: DataFormat,
    ) -> Result<Vec<f64>, DeviceError> {
        let buf = self
            .buffers
            .get(&buffer)
            .ok_or_else(|| call_err("enqueue_read_buffer", "unknown buffer handle"))?;
        Ok(Self::slice_or_pad(&buf.data, 0, element_count as usize))
    }

    fn write_to_device_scratch(
        &mut self,
        core: CoreCoord,
        address: usize,
        data: &[f64],
        _format: DataFormat,
    ) -> Result<(), DeviceError> {
        self.scratch.insert((core, address), data.to_vec());
        Ok(())
    }

    fn read_from_device_scratch(
        &mut self,
        core: CoreCoord,
        address: usize,
        element_count: u64,
        _format: DataFormat,
    ) -> Result<Vec<f64>, DeviceError> {
        let data = self
            .scratch
            .get(&(core, address))
            .ok_or_else(|| call_err("read_from_device_scratch", "nothing written at this address"))?;
        Ok(Self::slice_or_pad(data, 0, element_count as usize))
    }

    fn enqueue_program(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Interprets every core's [`KernelIr`] in core-row-major order: gathers
    /// each reader input's values straight from the buffers it was uploaded
    /// to, runs the lowered compute ops elementwise, and writes the results
    /// to the writer outputs' buffers. Real hardware runs all three
    /// processors concurrently pipelined through circular buffers; this
    /// model only needs to agree with it on the final buffer contents.
    fn finish(&mut self) -> Result<(), DeviceError> {
        let mut cores: Vec<CoreCoord> = self.kernel_ir.keys().copied().collect();
        cores.sort_by_key(|c| (c.row, c.col));

        for core in cores {
            let ir = self.kernel_ir.get(&core).expect("present").clone();
            let out_len = (ir.compute.tile_count * TILE_SIZE) as usize;

            let mut inputs: HashMap<String, Vec<f64>> = HashMap::new();
            for input in &ir.reader_inputs {
                inputs.insert(input.port.clone(), self.read_input(core, input, out_len)?);
            }

            let outputs = Self::run_compute(&ir.compute, &inputs, out_len);
            for output in &ir.writer_outputs {
                let values = outputs
                    .get(&output.port)
                    .cloned()
                    .unwrap_or_else(|| vec![0.0; out_len]);
                self.write_output(output, &values)?;
            }
        }
        Ok(())
    }

    fn observe_buffer(&mut self, owner: DramOwner, role: DramRole, handle: BufferHandle) {
        self.owners.insert((owner, role), handle);
    }

    fn observe_kernel_ir(&mut self, core: CoreCoord, ir: &KernelIr) {
        self.kernel_ir.insert(core, ir.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Endpoint, Map, MapConfig};
    use crate::kernel::Kernel;
    use crate::stream::{GatherStream, Stream, StorageTier};

    #[test]
    fn saxpy_runs_end_to_end() {
        let mut map = Map::new(MapConfig::default(), Some(DeviceConfig::default())).unwrap();
        let s0 = map.add_stream(Stream::new(vec![1.0; 16], DataFormat::Float32));
        let s1 = map.add_stream(Stream::new(vec![2.0; 16], DataFormat::Float32));
        let k0 = map.add_kernel(
            Kernel::new("saxpy")
                .with_input("in0", DataFormat::Float32)
                .with_input("in1", DataFormat::Float32)
                .with_output("out0", DataFormat::Float32)
                .with_compute("out0 = in0 * 2.0 + in1;"),
        );
        let s2 = map.add_stream(Stream::new(vec![0.0; 16], DataFormat::Float32));
        map.add_connection(Endpoint::stream(s0), Endpoint::kernel(k0, "in0")).unwrap();
        map.add_connection(Endpoint::stream(s1), Endpoint::kernel(k0, "in1")).unwrap();
        map.add_connection(Endpoint::kernel(k0, "out0"), Endpoint::stream(s2)).unwrap();

        let mut device = MockDeviceApi::default();
        map.execute(&mut device).unwrap();
        let out = map.read_stream(&mut device, s2).unwrap();
        assert_eq!(&out[..16], &vec![4.0; 16][..]);
    }

    #[test]
    fn pipeline_chains_two_kernels_through_dram() {
        let mut map = Map::new(MapConfig::default(), Some(DeviceConfig::default())).unwrap();
        let s0 = map.add_stream(Stream::new(vec![3.0; 8], DataFormat::Float32));
        let k0 = map.add_kernel(
            Kernel::new("double")
                .with_input("in0", DataFormat::Float32)
                .with_output("out0", DataFormat::Float32)
                .with_compute("out0 = in0 * 2.0;"),
        );
        let k1 = map.add_kernel(
            Kernel::new("inc")
                .with_input("in0", DataFormat::Float32)
                .with_output("out0", DataFormat::Float32)
                .with_compute("out0 = in0 + 1.0;"),
        );
        let s1 = map.add_stream(Stream::new(vec![0.0; 8], DataFormat::Float32));
        map.add_connection(Endpoint::stream(s0), Endpoint::kernel(k0, "in0")).unwrap();
        map.add_connection(Endpoint::kernel(k0, "out0"), Endpoint::kernel(k1, "in0")).unwrap();
        map.add_connection(Endpoint::kernel(k1, "out0"), Endpoint::stream(s1)).unwrap();

        let mut device = MockDeviceApi::default();
        map.execute(&mut device).unwrap();
        let out = map.read_stream(&mut device, s1).unwrap();
        assert_eq!(&out[..8], &vec![7.0; 8][..]);
    }

    #[test]
    fn gather_law_holds_for_dram_tier() {
        let mut map = Map::new(MapConfig::default(), Some(DeviceConfig::default())).unwrap();
        let data: Vec<f64> = (0..32).map(|i| i as f64).collect();
        let indices: Vec<u32> = (0..16).map(|i| (15 - i) as u32).collect();
        let g = map.add_gather_stream(GatherStream::new(
            data,
            DataFormat::Float32,
            indices.clone(),
            StorageTier::Dram,
            1,
        ));
        let k0 = map.add_kernel(
            Kernel::new("identity")
                .with_input("in0", DataFormat::Float32)
                .with_output("out0", DataFormat::Float32),
        );
        let s1 = map.add_stream(Stream::new(vec![0.0; 16], DataFormat::Float32));
        map.add_connection(Endpoint::stream(g), Endpoint::kernel(k0, "in0")).unwrap();
        map.add_connection(Endpoint::kernel(k0, "out0"), Endpoint::stream(s1)).unwrap();

        let mut device = MockDeviceApi::default();
        map.execute(&mut device).unwrap();
        let out = map.read_stream(&mut device, s1).unwrap();
        for (i, &idx) in indices.iter().enumerate() {
            assert_eq!(out[i], idx as f64);
        }
    }

    #[test]
    fn multi_access_gather_average_holds() {
        // accesses_per_token = 2, out0 = (in0+in1)*0.5, with in0/in1 each
        // bound to one access slot of the same gather stream.
        let mut map = Map::new(MapConfig::default(), Some(DeviceConfig::default())).unwrap();
        let data: Vec<f64> = (0..64).map(|i| i as f64).collect();
        let index_count = 32;
        let indices: Vec<u32> = (0..index_count).map(|i| (63 - i) as u32).collect();
        let g = map.add_gather_stream(GatherStream::new(
            data.clone(),
            DataFormat::Float32,
            indices.clone(),
            StorageTier::Dram,
            2,
        ));
        let k0 = map.add_kernel(
            Kernel::new("avg2")
                .with_input("in0", DataFormat::Float32)
                .with_input("in1", DataFormat::Float32)
                .with_output("out0", DataFormat::Float32)
                .with_compute("out0 = (in0 + in1) * 0.5;"),
        );
        let token_count = index_count as usize / 2;
        let s1 = map.add_stream(Stream::new(vec![0.0; token_count], DataFormat::Float32));
        map.add_connection(Endpoint::stream(g), Endpoint::kernel(k0, "in0")).unwrap();
        map.add_connection(Endpoint::stream(g), Endpoint::kernel(k0, "in1")).unwrap();
        map.add_connection(Endpoint::kernel(k0, "out0"), Endpoint::stream(s1)).unwrap();

        let mut device = MockDeviceApi::default();
        map.execute(&mut device).unwrap();
        let out = map.read_stream(&mut device, s1).unwrap();
        for i in 0..token_count {
            let expected = (data[indices[2 * i] as usize] + data[indices[2 * i + 1] as usize]) / 2.0;
            assert_eq!(out[i], expected);
        }
    }

    #[test]
    fn horizontal_box_blur_matches_reference_within_tolerance() {
        // width-3 box blur, 4 accesses per pixel (left, center, right,
        // unused filler), compute `out0 = (in0 + in1 + in2) * 0.33;` against
        // a Float16B image row.
        let width = 8usize;
        let image: Vec<f64> = (0..width).map(|i| (i as f64) / (width as f64)).collect();
        let clamped = |i: isize| image[i.clamp(0, width as isize - 1) as usize];

        let mut indices = Vec::with_capacity(width * 4);
        for i in 0..width as isize {
            indices.push(clamp_index(i - 1, width));
            indices.push(clamp_index(i, width));
            indices.push(clamp_index(i + 1, width));
            indices.push(0);
        }

        let mut map = Map::new(MapConfig::default(), Some(DeviceConfig::default())).unwrap();
        let g = map.add_gather_stream(GatherStream::new(
            image.clone(),
            DataFormat::Float16B,
            indices,
            StorageTier::Dram,
            4,
        ));
        let k0 = map.add_kernel(
            Kernel::new("box_blur_3")
                .with_input("in0", DataFormat::Float16B)
                .with_input("in1", DataFormat::Float16B)
                .with_input("in2", DataFormat::Float16B)
                .with_output("out0", DataFormat::Float16B)
                .with_compute("out0 = (in0 + in1 + in2) * 0.33;"),
        );
        let s1 = map.add_stream(Stream::new(vec![0.0; width], DataFormat::Float16B));
        map.add_connection(Endpoint::stream(g), Endpoint::kernel(k0, "in0")).unwrap();
        map.add_connection(Endpoint::stream(g), Endpoint::kernel(k0, "in1")).unwrap();
        map.add_connection(Endpoint::stream(g), Endpoint::kernel(k0, "in2")).unwrap();
        map.add_connection(Endpoint::kernel(k0, "out0"), Endpoint::stream(s1)).unwrap();

        let mut device = MockDeviceApi::default();
        map.execute(&mut device).unwrap();
        let out = map.read_stream(&mut device, s1).unwrap();
        for i in 0..width as isize {
            let reference = (clamped(i - 1) + clamped(i) + clamped(i + 1)) * 0.33;
            assert!(
                (out[i as usize] - reference).abs() <= 1.0 / 255.0,
                "pixel {} = {} vs reference {}",
                i,
                out[i as usize],
                reference
            );
        }
    }

    fn clamp_index(i: isize, width: usize) -> u32 {
        i.clamp(0, width as isize - 1) as u32
    }

    #[test]
    fn gather_law_holds_for_scratch_tier() {
        let mut map = Map::new(MapConfig::default(), Some(DeviceConfig::default())).unwrap();
        let data: Vec<f64> = (0..32).map(|i| (i * 10) as f64).collect();
        let indices: Vec<u32> = (0..16).map(|i| i as u32).collect();
        let g = map.add_gather_stream(GatherStream::new(
            data,
            DataFormat::Float32,
            indices.clone(),
            StorageTier::Scratch,
            1,
        ));
        let k0 = map.add_kernel(
            Kernel::new("identity")
                .with_input("in0", DataFormat::Float32)
                .with_output("out0", DataFormat::Float32),
        );
        let s1 = map.add_stream(Stream::new(vec![0.0; 16], DataFormat::Float32));
        map.add_connection(Endpoint::stream(g), Endpoint::kernel(k0, "in0")).unwrap();
        map.add_connection(Endpoint::kernel(k0, "out0"), Endpoint::stream(s1)).unwrap();

        let mut device = MockDeviceApi::default();
        map.execute(&mut device).unwrap();
        let out = map.read_stream(&mut device, s1).unwrap();
        for (i, &idx) in indices.iter().enumerate() {
            assert_eq!(out[i], (idx * 10) as f64);
        }
    }

}
