pub mod cache;
pub mod engine;
pub mod file_state;
pub mod ledger;
pub mod scanner;
pub mod watcher;

pub use cache::ListingCache;
pub use engine::{spawn_auto_sync, SyncEngine, SyncReport, SyncStatus};
pub use file_state::{FileRecord, SyncState, SyncStateStore};
pub use ledger::{ChangeKind, ChangeLedger, PendingChange};
pub use scanner::{scan_local_tree, ScanResult};
pub use watcher::VaultWatcher;
