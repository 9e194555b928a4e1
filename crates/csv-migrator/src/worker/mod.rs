pub mod archive;
pub mod intake;
pub mod scanner;
pub mod scheduler;

pub use intake::Intake;
pub use scanner::DirectoryScanner;
pub use scheduler::{ImportScheduler, ImportSummary};
