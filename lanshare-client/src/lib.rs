pub mod api;
pub mod config;
pub mod error;
pub mod notify;
pub mod settings;
pub mod sync;
pub mod transport;
pub mod upload;

pub use api::{ApiClient, FileService, ServerInfo};
pub use config::ClientConfig;
pub use error::{ClientError, UploadError};
pub use notify::{AssumeAnswer, Confirm, Notice, Notifier, RecordingNotifier};
pub use sync::{Action, Synchronizer, delete_all_sequential};
pub use transport::{TransportHandle, spawn_transport};
pub use upload::{ProgressFn, UploadOutcome, no_progress, upload_batch};
