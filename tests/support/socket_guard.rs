//! Skips wiremock tests on hosts that cannot bind a localhost socket.
//!
//! Set `REQCACHE_REQUIRE_SOCKET_TESTS=1` to turn a skip into a failure (CI).

use std::net::TcpListener;
use std::panic::Location;

use wiremock::MockServer;

const REQUIRE_ENV: &str = "REQCACHE_REQUIRE_SOCKET_TESTS";

/// Starts a mock server, or returns `None` (after logging why) when sockets are unavailable.
#[track_caller]
pub fn start_mock_server_or_skip() -> impl Future<Output = Option<MockServer>> {
    let location = Location::caller();
    let bindable = TcpListener::bind("127.0.0.1:0").is_ok();
    async move {
        if bindable {
            return Some(MockServer::start().await);
        }
        let required = std::env::var(REQUIRE_ENV)
            .is_ok_and(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"));
        assert!(
            !required,
            "cannot bind a localhost socket for {}:{}",
            location.file(),
            location.line()
        );
        eprintln!(
            "skipping {}:{}: cannot bind a localhost socket",
            location.file(),
            location.line()
        );
        None
    }
}

/// Value a test returns when it is skipped.
pub trait Skipped {
    fn skipped() -> Self;
}

impl Skipped for () {
    fn skipped() -> Self {}
}

impl<E> Skipped for Result<(), E> {
    fn skipped() -> Self {
        Ok(())
    }
}

pub fn socket_skip_return<T: Skipped>() -> T {
    T::skipped()
}
