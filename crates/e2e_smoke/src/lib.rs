//! End-to-end checks of the gateway router against Postgres; see `tests/`.
