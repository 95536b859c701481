use typed_builder::TypedBuilder;

/// Limits and switches for the command engine.
#[derive(Clone, Debug, TypedBuilder)]
pub struct EngineConfig {
    /// Reuse the buffers of transient sub-results. Turning this off never
    /// changes a result, only how much gets allocated.
    #[builder(default = true)]
    pub in_place_updates: bool,
    /// Maximum nesting of operation nodes in one expression tree.
    #[builder(default = 64)]
    pub max_ast_depth: usize,
    /// Largest array a creation command may ask for, in elements.
    #[builder(default = 1 << 28)]
    pub max_array_elements: u64,
    /// Whether a client may stop the server with a shutdown command.
    #[builder(default = false)]
    pub allow_remote_shutdown: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
