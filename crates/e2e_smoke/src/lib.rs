// Intentionally empty; this crate exists for its integration tests.
