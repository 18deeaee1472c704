// Services module
pub mod challenge;
pub mod key_service;
pub mod proxy_dialer;
pub mod session_relay;
pub mod ssh_service;
