// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Puts `memory.x` on the linker search path for the firmware image, and
//! asks for `cortex-m-rt`'s `link.x`.
//!
//! Only done when cross compiling, so that `cargo test` on the host links
//! normally.

fn main() {
    println!("cargo:rerun-if-changed=memory.x");
    println!("cargo:rerun-if-changed=build.rs");

    if std::env::var("HOST") != std::env::var("TARGET") {
        println!(
            "cargo:rustc-link-arg-bins=-L{}",
            std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string())
        );
        println!("cargo:rustc-link-arg-bins=-Tlink.x");
    }
}
