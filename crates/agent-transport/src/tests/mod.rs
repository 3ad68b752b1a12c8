//! Scenario tests for the delivery subsystem.
//!
//! - `harness.rs`  - scripted transport, recording listeners, instant sleeper
//! - `capacity.rs` - byte accounting and FIFO under mixed and concurrent use
//! - `backoff.rs`  - attempt counts and delay caps of the retry policy
//! - `delivery.rs` - queue-draining sender outcomes and shutdown
//! - `recovery.rs` - single-flight recovery after out-of-band failure
//! - `handshake.rs` - registration retries and liveness announcement

mod recovery;
