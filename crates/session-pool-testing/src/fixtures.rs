//! Test fixture utilities.

/// Connection string of the first test user.
pub const ALICE: &str = "account=acme;user=alice;password=alice-secret;db=SALES";

/// Connection string of the second test user. Same account, different user.
pub const BOB: &str = "account=acme;user=bob;password=bob-secret;db=SALES";

/// Build a connection string for `user` with extra `key=value` pairs.
#[must_use]
pub fn conn_str(user: &str, extra: &[(&str, &str)]) -> String {
    let mut conn_str = format!("account=acme;user={user};password={user}-secret;db=SALES");
    for (key, value) in extra {
        conn_str.push(';');
        conn_str.push_str(key);
        conn_str.push('=');
        conn_str.push_str(value);
    }
    conn_str
}

/// Route tracing output to the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("session_pool=debug")),
        )
        .with_test_writer()
        .try_init();
}
