//! Worker loop and output-plugin host: drains session notifications,
//! leases flows and drives `FlowRunner` to completion.

pub mod output_plugins;
pub mod worker;

pub use output_plugins::{OutputPlugin, OutputPluginHost};
pub use worker::Worker;
