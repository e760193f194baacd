pub mod document;
pub mod environment;
pub mod loader;

// Re-export commonly used types
pub use document::{ConfigSection, ConfigurationDocument};
pub use environment::Environment;
pub use loader::{ConfigurationCache, DocumentParser, FileDocumentParser};
