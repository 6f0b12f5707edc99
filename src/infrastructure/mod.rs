pub mod portal_driver;

pub use portal_driver::{ChromeDriver, PortalDriver, WaitCondition};
