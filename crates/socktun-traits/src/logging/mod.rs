pub trait LoggingService {
    /// Installs the global subscriber. `level_str` is the default directive and is
    /// overridden per target by `RUST_LOG`.
    fn init_logging(
        level_str: &str,
        use_color: bool,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}
