pub mod context;
mod handler;

pub use context::{counting_body, AccessLogItem, BoxBody, LogShipper, RequestContext, TracingLogShipper};
pub use handler::handle_request;
