pub mod client;
pub mod error;

pub use client::{HttpResponse, HttpTransport, ReqwestTransport, send_with_retry};
pub use error::HttpError;
