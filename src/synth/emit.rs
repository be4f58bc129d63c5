//! Renders a [`super::KernelIr`] to the three source texts the host SDK
//! compiles onto a core's three processors.
//!
//! This is plain string templating, not code generation through an AST —
//! the source text is itself the compiled artifact handed to
//! `kernel_register`, so there is nothing further to parse on our side.
//! Every function here is a pure function of its `KernelIr` argument, which
//! is what makes synthesis deterministic: two equal `KernelIr`s always
//! render to byte-identical source.

use std::fmt::Write as _;

use super::{ComputeIr, ComputeOp, InputKind, KernelIr, ReaderInput, WriterOutput};
use crate::format::{DRAM_ACCESS_ALIGN, TILE_SIZE};

/// DRAM gather reads always stride at `DRAM_ACCESS_ALIGN` bytes regardless of
/// the data format's native width — a per-bank alignment quirk to confirm
/// against current host-SDK docs rather than to blindly trust.
fn dram_gather_stride() -> u64 {
    DRAM_ACCESS_ALIGN
}

fn emit_reader_plain(out: &mut String, input: &ReaderInput, arg_base: usize) {
    writeln!(out, "    // input \"{}\" -> cb {}", input.port, input.cb_id).unwrap();
    writeln!(
        out,
        "    uint32_t {}_addr = get_arg_val<uint32_t>({});",
        input.port,
        arg_base
    )
    .unwrap();
    writeln!(
        out,
        "    uint32_t {0}_noc_x = get_arg_val<uint32_t>({1});",
        input.port,
        arg_base + 1
    )
    .unwrap();
    writeln!(
        out,
        "    uint32_t {0}_noc_y = get_arg_val<uint32_t>({1});",
        input.port,
        arg_base + 2
    )
    .unwrap();
    writeln!(
        out,
        "    uint64_t {0}_noc_addr = get_noc_addr({0}_noc_x, {0}_noc_y, {0}_addr);",
        input.port
    )
    .unwrap();
    writeln!(
        out,
        "    uint32_t {0}_tile_size = get_tile_size({1});",
        input.port, input.cb_id
    )
    .unwrap();
    writeln!(out, "    for (uint32_t i = 0; i < {}; i++) {{", input.tile_count).unwrap();
    writeln!(out, "        cb_reserve_back({}, 1);", input.cb_id).unwrap();
    writeln!(
        out,
        "        uint32_t l1_addr = get_write_ptr({});",
        input.cb_id
    )
    .unwrap();
    writeln!(
        out,
        "        noc_async_read({0}_noc_addr + (i + {1}) * {0}_tile_size, l1_addr, {0}_tile_size);",
        input.port, input.tile_start
    )
    .unwrap();
    writeln!(out, "        noc_async_read_barrier();").unwrap();
    writeln!(out, "        cb_push_back({}, 1);", input.cb_id).unwrap();
    writeln!(out, "    }}").unwrap();
}

fn emit_reader_gather(
    out: &mut String,
    input: &ReaderInput,
    arg_base: usize,
    accesses_per_token: u64,
    index_cb_id: u32,
    scratch_base: Option<usize>,
) {
    let access_slot = input.access_slot;
    writeln!(
        out,
        "    // gather input \"{}\" -> cb {} (accesses_per_token={}, access_slot={})",
        input.port, input.cb_id, accesses_per_token, access_slot
    )
    .unwrap();
    writeln!(
        out,
        "    uint32_t {0}_index_dram_addr = get_arg_val<uint32_t>({1});",
        input.port, arg_base
    )
    .unwrap();
    writeln!(
        out,
        "    uint32_t {0}_index_noc_x = get_arg_val<uint32_t>({1});",
        input.port,
        arg_base + 1
    )
    .unwrap();
    writeln!(
        out,
        "    uint32_t {0}_index_noc_y = get_arg_val<uint32_t>({1});",
        input.port,
        arg_base + 2
    )
    .unwrap();
    writeln!(
        out,
        "    uint64_t {0}_index_noc_addr = get_noc_addr({0}_index_noc_x, {0}_index_noc_y, {0}_index_dram_addr);",
        input.port
    )
    .unwrap();

    match scratch_base {
        None => {
            writeln!(
                out,
                "    uint32_t {0}_data_dram_addr = get_arg_val<uint32_t>({1});",
                input.port,
                arg_base + 3
            )
            .unwrap();
            writeln!(
                out,
                "    uint32_t {0}_data_noc_x = get_arg_val<uint32_t>({1});",
                input.port,
                arg_base + 4
            )
            .unwrap();
            writeln!(
                out,
                "    uint32_t {0}_data_noc_y = get_arg_val<uint32_t>({1});",
                input.port,
                arg_base + 5
            )
            .unwrap();
            writeln!(
                out,
                "    uint64_t {0}_data_noc_addr = get_noc_addr({0}_data_noc_x, {0}_data_noc_y, {0}_data_dram_addr);",
                input.port
            )
            .unwrap();
        }
        Some(base) => {
            writeln!(
                out,
                "    uint32_t {}_scratch_base = {}; // L1 base for this core's gather broadcast",
                input.port, base
            )
            .unwrap();
        }
    }

    writeln!(
        out,
        "    uint32_t {0}_index_tile_size = get_tile_size({1});",
        input.port, index_cb_id
    )
    .unwrap();
    match scratch_base {
        None => {
            writeln!(out, "    uint32_t {0}_elem_stride = {1};", input.port, dram_gather_stride()).unwrap();
        }
        Some(_) => {
            // Scratch reads are at the data format's native width, derived
            // from the data CB's tile size rather than hardcoded, since this
            // reader text has no direct `DataFormat` parameter.
            writeln!(
                out,
                "    uint32_t {0}_elem_stride = get_tile_size({1}) / {2};",
                input.port, input.cb_id, TILE_SIZE
            )
            .unwrap();
        }
    }
    // Each output tile holds TILE_SIZE tokens; a token's raw lookups live at
    // stride `accesses_per_token` in the gather stream's index buffer, so
    // this tile's index window spans `TILE_SIZE * accesses_per_token` raw
    // indices starting at the token-space tile offset times that stride.
    writeln!(out, "    for (uint32_t t = 0; t < {}; t++) {{", input.tile_count).unwrap();
    writeln!(
        out,
        "        cb_reserve_back({}, {});",
        index_cb_id, accesses_per_token
    )
    .unwrap();
    writeln!(
        out,
        "        uint32_t l1_index_addr = get_write_ptr({});",
        index_cb_id
    )
    .unwrap();
    writeln!(
        out,
        "        noc_async_read({0}_index_noc_addr + (t + {1}) * {2} * {0}_index_tile_size, l1_index_addr, {2} * {0}_index_tile_size);",
        input.port, input.tile_start, accesses_per_token
    )
    .unwrap();
    writeln!(out, "        noc_async_read_barrier();").unwrap();
    writeln!(out, "        cb_push_back({}, {});", index_cb_id, accesses_per_token).unwrap();
    writeln!(out, "        cb_reserve_back({}, 1);", input.cb_id).unwrap();
    writeln!(
        out,
        "        uint32_t l1_data_addr = get_write_ptr({});",
        input.cb_id
    )
    .unwrap();
    writeln!(
        out,
        "        uint32_t* indices = (uint32_t*)l1_index_addr;"
    )
    .unwrap();
    writeln!(out, "        for (uint32_t j = 0; j < {}; j++) {{", TILE_SIZE).unwrap();
    writeln!(
        out,
        "            uint32_t idx = indices[j * {} + {}];",
        accesses_per_token, access_slot
    )
    .unwrap();
    match scratch_base {
        None => {
            writeln!(
                out,
                "            uint32_t src_offset = idx * {}_elem_stride;",
                input.port
            )
            .unwrap();
            writeln!(
                out,
                "            uint32_t dst_offset = j * {}_elem_stride;",
                input.port
            )
            .unwrap();
            writeln!(
                out,
                "            noc_async_read({0}_data_noc_addr + src_offset, l1_data_addr + dst_offset, {0}_elem_stride);",
                input.port
            )
            .unwrap();
            writeln!(out, "            noc_async_read_barrier();").unwrap();
        }
        Some(_) => {
            writeln!(
                out,
                "            uint32_t src_offset = {0}_scratch_base + idx * {0}_elem_stride;",
                input.port
            )
            .unwrap();
            writeln!(
                out,
                "            uint32_t dst_offset = j * {}_elem_stride;",
                input.port
            )
            .unwrap();
            writeln!(
                out,
                "            memcpy_l1((void*)(l1_data_addr + dst_offset), (void*)src_offset, {}_elem_stride);",
                input.port
            )
            .unwrap();
        }
    }
    writeln!(out, "        }}").unwrap();
    writeln!(out, "        cb_push_back({}, 1);", input.cb_id).unwrap();
    writeln!(out, "    }}").unwrap();
}

/// Emits the reader kernel: transports every input edge's slice from DRAM
/// (or scratch) into its circular buffer.
pub fn emit_reader(ir: &KernelIr) -> String {
    let mut out = String::new();
    out.push_str("#include \"dataflow_api.h\"\n\nvoid kernel_main() {\n");
    let mut arg_base = 0usize;
    for input in &ir.reader_inputs {
        match input.kind {
            InputKind::Plain => {
                emit_reader_plain(&mut out, input, arg_base);
                arg_base += 3;
            }
            InputKind::GatherDram {
                accesses_per_token,
                index_cb_id,
            } => {
                emit_reader_gather(&mut out, input, arg_base, accesses_per_token, index_cb_id, None);
                arg_base += 6;
            }
            InputKind::GatherScratch {
                accesses_per_token,
                index_cb_id,
                scratch_base,
            } => {
                emit_reader_gather(
                    &mut out,
                    input,
                    arg_base,
                    accesses_per_token,
                    index_cb_id,
                    Some(scratch_base),
                );
                arg_base += 3;
            }
        }
        out.push('\n');
    }
    out.push_str("}\n");
    out
}

fn emit_op(out: &mut String, op: &ComputeOp) {
    match op {
        ComputeOp::LoadInput(name) => writeln!(out, "    stack.push(load_tile(\"{}\"));", name).unwrap(),
        ComputeOp::LoadConst(bits) => {
            writeln!(out, "    stack.push(tile_splat({:#018x}));", bits).unwrap()
        }
        ComputeOp::Add => out.push_str("    stack.push(tile_add(stack.pop(), stack.pop()));\n"),
        ComputeOp::Sub => out.push_str("    stack.push(tile_sub_rev(stack.pop(), stack.pop()));\n"),
        ComputeOp::Mul => out.push_str("    stack.push(tile_mul(stack.pop(), stack.pop()));\n"),
        ComputeOp::Div => out.push_str("    stack.push(tile_div_rev(stack.pop(), stack.pop()));\n"),
        ComputeOp::Neg => out.push_str("    stack.push(tile_neg(stack.pop()));\n"),
        ComputeOp::StoreOutput(name) => {
            writeln!(out, "    store_tile(\"{}\", stack.pop());", name).unwrap()
        }
    }
}

/// Emits the compute kernel: per tile iteration, waits on every input CB,
/// runs the lowered arithmetic, pushes every output CB.
pub fn emit_compute(ir: &KernelIr) -> String {
    let ComputeIr {
        tile_count,
        input_cbs,
        output_cbs,
        ops,
    } = &ir.compute;

    let mut out = String::new();
    out.push_str("#include \"compute_kernel_api.h\"\n\nnamespace NAMESPACE {\nvoid MAIN {\n");
    writeln!(out, "    for (uint32_t i = 0; i < {}; i++) {{", tile_count).unwrap();
    for (_, cb) in input_cbs {
        writeln!(out, "        cb_wait_front({}, 1);", cb).unwrap();
    }
    out.push_str("        TileStack stack;\n");
    for op in ops {
        emit_op(&mut out, op);
    }
    for (_, cb) in output_cbs {
        writeln!(out, "        cb_reserve_back({}, 1);", cb).unwrap();
    }
    for (_, cb) in input_cbs {
        writeln!(out, "        cb_pop_front({}, 1);", cb).unwrap();
    }
    for (_, cb) in output_cbs {
        writeln!(out, "        cb_push_back({}, 1);", cb).unwrap();
    }
    out.push_str("    }\n");
    out.push_str("}\n}\n");
    out
}

fn emit_writer_output(out: &mut String, output: &WriterOutput, arg_base: usize) {
    writeln!(out, "    // output \"{}\" <- cb {}", output.port, output.cb_id).unwrap();
    writeln!(
        out,
        "    uint32_t {0}_addr = get_arg_val<uint32_t>({1});",
        output.port, arg_base
    )
    .unwrap();
    writeln!(
        out,
        "    uint32_t {0}_noc_x = get_arg_val<uint32_t>({1});",
        output.port,
        arg_base + 1
    )
    .unwrap();
    writeln!(
        out,
        "    uint32_t {0}_noc_y = get_arg_val<uint32_t>({1});",
        output.port,
        arg_base + 2
    )
    .unwrap();
    writeln!(
        out,
        "    uint64_t {0}_noc_addr = get_noc_addr({0}_noc_x, {0}_noc_y, {0}_addr);",
        output.port
    )
    .unwrap();
    writeln!(
        out,
        "    uint32_t {0}_tile_size = get_tile_size({1});",
        output.port, output.cb_id
    )
    .unwrap();
    writeln!(out, "    for (uint32_t i = 0; i < {}; i++) {{", output.tile_count).unwrap();
    writeln!(out, "        cb_wait_front({}, 1);", output.cb_id).unwrap();
    writeln!(
        out,
        "        uint32_t l1_addr = get_read_ptr({});",
        output.cb_id
    )
    .unwrap();
    writeln!(
        out,
        "        noc_async_write(l1_addr, {0}_noc_addr + (i + {1}) * {0}_tile_size, {0}_tile_size);",
        output.port, output.tile_start
    )
    .unwrap();
    writeln!(out, "        noc_async_write_barrier();").unwrap();
    writeln!(out, "        cb_pop_front({}, 1);", output.cb_id).unwrap();
    writeln!(out, "    }}").unwrap();
}

/// Emits the writer kernel: drains every output edge's circular buffer to
/// its destination DRAM slice.
pub fn emit_writer(ir: &KernelIr) -> String {
    let mut out = String::new();
    out.push_str("#include \"dataflow_api.h\"\n\nvoid kernel_main() {\n");
    let mut arg_base = 0usize;
    for output in &ir.writer_outputs {
        emit_writer_output(&mut out, output, arg_base);
        arg_base += 3;
        out.push('\n');
    }
    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::{ComputeIr, ComputeOp, KernelIr, ReaderInput, WriterOutput};

    fn passthrough_ir() -> KernelIr {
        KernelIr {
            reader_inputs: vec![ReaderInput {
                port: "in0".into(),
                cb_id: 0,
                tile_count: 2,
                tile_start: 0,
                kind: InputKind::Plain,
                access_slot: 0,
                edge: crate::graph::EdgeId(0),
                owner: crate::graph::DramOwner::Stream(crate::stream::StreamId(0)),
            }],
            compute: ComputeIr {
                tile_count: 2,
                input_cbs: vec![("in0".into(), 0)],
                output_cbs: vec![("out0".into(), 16)],
                ops: vec![
                    ComputeOp::LoadInput("in0".into()),
                    ComputeOp::StoreOutput("out0".into()),
                ],
            },
            writer_outputs: vec![WriterOutput {
                port: "out0".into(),
                cb_id: 16,
                tile_count: 2,
                tile_start: 0,
                edge: crate::graph::EdgeId(1),
                owner: crate::graph::DramOwner::Stream(crate::stream::StreamId(1)),
            }],
        }
    }

    #[test]
    fn emission_is_deterministic() {
        let ir = passthrough_ir();
        assert_eq!(emit_reader(&ir), emit_reader(&ir));
        assert_eq!(emit_compute(&ir), emit_compute(&ir));
        assert_eq!(emit_writer(&ir), emit_writer(&ir));
    }

    #[test]
    fn reader_mentions_every_input_cb() {
        let ir = passthrough_ir();
        let text = emit_reader(&ir);
        assert!(text.contains("cb_push_back(0, 1)"));
    }

    #[test]
    fn compute_waits_before_pop_and_pushes_after() {
        let ir = passthrough_ir();
        let text = emit_compute(&ir);
        let wait = text.find("cb_wait_front").unwrap();
        let pop = text.find("cb_pop_front").unwrap();
        let push = text.find("cb_push_back").unwrap();
        assert!(wait < pop);
        assert!(pop < push);
    }

    #[test]
    fn writer_barrier_precedes_pop() {
        let ir = passthrough_ir();
        let text = emit_writer(&ir);
        let barrier = text.find("noc_async_write_barrier").unwrap();
        let pop = text.find("cb_pop_front").unwrap();
        assert!(barrier < pop);
    }
}
