mod address;
mod backing_file;
mod error;
mod pool;
mod predicate;
pub mod process;
mod region;
mod scan;
mod scanner;
mod snapshot;

pub use self::address::{Address, AddressRange};
pub use self::backing_file::{BackingFile, Mapping, PAGE_SIZE};
pub use self::error::Error;
pub use self::pool::{TaskHandle, WorkerPool};
pub use self::predicate::{comparator, Comparator, ElementType, ScanKind};
pub use self::process::{MemoryState, MemoryType, ProcessMemory, ProtectFlags, RegionInfo};
pub use self::region::{MemoryRegion, RegionIter};
pub use self::scan::{Scan, ScanEntry};
pub use self::scanner::{global, Scanner, ScannerBuilder};
pub use self::snapshot::{SnapshotStore, Span};
