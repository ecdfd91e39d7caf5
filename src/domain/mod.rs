// Domain layer: exchange data model and ports (interfaces) consumed by the cycle.

pub mod model;
pub mod ports;
