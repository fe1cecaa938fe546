//! TUI module for terminal user interfaces

mod validation_view;

pub use validation_view::ValidationDashboard;
