pub mod common;
pub mod completions;
pub mod init;
pub mod pairing;
pub mod record;
pub mod relay_cmd;
pub mod status;
pub mod sync;
