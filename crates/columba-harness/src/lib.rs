//! Columba Harness
//!
//! Deterministic fakes for the collaborators the Columba runtime drives: a
//! scriptable mesh engine, a reactive in-memory relay store and a counting
//! resource provider. Shared by the runtime's tests and the CLI simulator.

pub mod engine;
pub mod fixtures;
pub mod resources;
pub mod store;

pub use engine::{MockEngine, MockEngineFactory, MockEngineScript};
pub use resources::CountingResourceProvider;
pub use store::InMemoryRelayStore;
