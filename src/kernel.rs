//! Kernel descriptors: the compute operators of the graph.

use crate::format::DataFormat;

/// Newtype index into a [`crate::graph::Map`]'s kernel arena. See
/// [`crate::stream::StreamId`] for the rationale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub(crate) u32);

/// A named, typed port on a [`Kernel`].
#[derive(Debug, Clone, PartialEq)]
pub struct Port {
    pub name: String,
    pub format: DataFormat,
}

impl Port {
    pub fn new(name: impl Into<String>, format: DataFormat) -> Self {
        Self {
            name: name.into(),
            format,
        }
    }
}

/// A compute operator: a fixed set of input and output ports plus a compute
/// expression that maps the former to the latter, one tile at a time.
///
/// `compute_expression` is `None` only for kernels the runtime treats as
/// opaque (e.g. a future custom/runtime-arg kernel); every kernel reachable
/// by [`crate::synth`] today carries one.
#[derive(Debug, Clone)]
pub struct Kernel {
    pub name: String,
    pub input_ports: Vec<Port>,
    pub output_ports: Vec<Port>,
    pub compute_expression: Option<String>,
    pub uses_runtime_args: bool,
}

impl Kernel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_ports: Vec::new(),
            output_ports: Vec::new(),
            compute_expression: None,
            uses_runtime_args: false,
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, format: DataFormat) -> Self {
        self.input_ports.push(Port::new(name, format));
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, format: DataFormat) -> Self {
        self.output_ports.push(Port::new(name, format));
        self
    }

    pub fn with_compute(mut self, expression: impl Into<String>) -> Self {
        self.compute_expression = Some(expression.into());
        self
    }

    pub fn input_port(&self, name: &str) -> Option<&Port> {
        self.input_ports.iter().find(|p| p.name == name)
    }

    pub fn output_port(&self, name: &str) -> Option<&Port> {
        self.output_ports.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_ports() {
        let k = Kernel::new("saxpy")
            .with_input("x", DataFormat::Float32)
            .with_input("y", DataFormat::Float32)
            .with_output("z", DataFormat::Float32)
            .with_compute("out0 = x * 2 + y;");
        assert_eq!(k.input_ports.len(), 2);
        assert_eq!(k.output_ports.len(), 1);
        assert!(k.input_port("x").is_some());
        assert!(k.output_port("missing").is_none());
    }
}
