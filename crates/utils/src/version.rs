use std::sync::LazyLock;

/// Defines the application version.
///
/// `IMAGE_VERSION` is stamped in by the container build; local builds fall
/// back to the crate version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    option_env!("IMAGE_VERSION")
        .unwrap_or(env!("CARGO_PKG_VERSION"))
        .to_string()
});
