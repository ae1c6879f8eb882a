// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "macos"))] {
        mod nix_impl {
            pub mod signal;
            pub mod timer;
        }

        pub use nix_impl::signal::{interrupted_pc, register, unregister, ErrnoProtector};
        pub use nix_impl::timer::Timer;
    }
}
