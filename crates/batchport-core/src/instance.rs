use crate::Device;

/// What the host tells us about one execution instance of a model.
#[derive(Clone, Debug)]
pub struct InstanceDescriptor {
    pub name: String,
    pub device: Device,
}

impl InstanceDescriptor {
    pub fn new(name: impl Into<String>, device: Device) -> Self {
        Self {
            name: name.into(),
            device,
        }
    }

    pub fn cpu(name: impl Into<String>) -> Self {
        Self::new(name, Device::Cpu)
    }
}
