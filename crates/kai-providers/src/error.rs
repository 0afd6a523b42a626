#[derive(Clone, Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("No provider available")]
    NoProviderAvailable,

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider {0} is not available")]
    NotAvailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_messages() {
        assert_eq!(
            ProviderError::NoProviderAvailable.to_string(),
            "No provider available"
        );
        assert!(ProviderError::UnknownProvider("x".into())
            .to_string()
            .contains("Unknown provider"));
        assert!(ProviderError::NotAvailable("x".into())
            .to_string()
            .contains("not available"));
    }
}
