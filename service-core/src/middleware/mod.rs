pub mod request_context;

pub use request_context::{BUSINESS_ID_HEADER, REQUEST_ID_HEADER, request_context_middleware};
