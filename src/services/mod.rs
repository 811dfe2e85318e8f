// Cart, catalog and pricing
pub mod commerce;

// Order materialization and lifecycle
pub mod orders;
