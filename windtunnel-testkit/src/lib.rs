//! Test support for windtunnel: an in-memory compute backend that walks
//! tasks through the solver pipeline, plus template and mesh fixtures.

mod backend;
mod fixtures;

pub use backend::{InMemoryBackend, PoolRecord, TaskScript};
pub use fixtures::{
    example_parameters, example_wind_tunnel, write_mesh, write_template_tree, Workspace,
    BINARY_ASSET, VEHICLE_OBJ,
};
