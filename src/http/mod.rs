pub mod client;
pub mod method;
pub mod request;
pub mod response;

pub use client::{HttpExecutor, ReqwestExecutor, RequestError};
pub use method::HttpMethod;
pub use request::ResolvedRequest;
pub use response::HttpResponse;
