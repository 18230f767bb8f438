/*!
# Endpoint DevKit - loopback stubs for agent tests

- [`MockCollector`]: registration endpoint and sealed websocket stream
- [`StatusServer`]: HTTP target answering with a fixed status code
- [`test_utils`]: logging setup and polling helpers
*/

pub mod collector_stub;
pub mod http_stub;
pub mod test_utils;

pub use collector_stub::{MockCollector, RegisterMode};
pub use http_stub::StatusServer;
