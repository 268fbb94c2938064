//! Runnable demos for `caching-loader` live under `examples/`.
