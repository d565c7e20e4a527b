pub mod backend;
pub mod dmabuf;
pub mod mem;

pub use backend::{LibcBackend, RealBackend};
pub use dmabuf::{DescriptorProbe, DmaBuf, ProcFdInfo};
