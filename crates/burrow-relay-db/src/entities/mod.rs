//! Database entities

pub mod captured_request;
pub mod unknown_request;

pub use captured_request::Entity as CapturedRequest;
pub use unknown_request::Entity as UnknownRequest;

pub mod prelude {
    pub use super::captured_request::Entity as CapturedRequest;
    pub use super::unknown_request::Entity as UnknownRequest;
}
