mod descriptor;
mod directory;

pub use descriptor::{ServerCertificate, ServerDescriptor, TrustCheck, TrustMaterial};
pub use directory::ServerDirectory;
