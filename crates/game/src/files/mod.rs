mod resources;
mod server_files;

pub use resources::{ResourceCache, ResourceRecord, digest_of};
pub use server_files::{
    FILE_ANIMS, FILE_BMAPS, FILE_EFFECTS, FILE_HFILES, FILE_SETTINGS, FILE_UPDATES, LISTING_NAME,
    ServerFileEntry, ServerFileHandler, ServerFiles, UpdateState,
};
