//! Integration-test member; all scenarios live under `tests/`.
