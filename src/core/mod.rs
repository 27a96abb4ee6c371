pub mod session_id;
pub mod utils;

pub use session_id::SessionId;
pub use utils::scratch_file_name;
