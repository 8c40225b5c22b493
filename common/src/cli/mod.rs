//! Command-line policy: terminal color handling for `--color`.

mod color;

pub use color::ColorWhen;
