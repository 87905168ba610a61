#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use trellis_controller_core as core;
pub use trellis_controller_envoy as envoy;
pub use trellis_controller_k8s_api as k8s;
pub use trellis_controller_k8s_index as index;

mod args;

pub use self::args::Args;
