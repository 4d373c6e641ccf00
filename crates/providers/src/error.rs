use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{service} returned HTTP {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },
    #[error("slack api error: {0}")]
    Api(String),
    #[error("{0} credentials are missing")]
    MissingCredentials(&'static str),
}
