/// Per-request data stamped by the `request_id` middleware.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: String,
}
