//! Catalogues of installable protoc plugins per ecosystem.
//!
//! These tables pin the default version and binary name for each plugin the
//! installers know how to provide. Requesting a tool outside the catalogue
//! makes `supports` answer false, which is distinct from an install that ran
//! and failed.

/// One cargo-installable plugin.
#[derive(Debug, Clone, Copy)]
pub struct CargoPlugin {
    /// Catalogue key.
    pub name: &'static str,
    /// The crate to `cargo install`.
    pub crate_name: &'static str,
    /// The binary the crate installs.
    pub binary: &'static str,
    /// Pinned default version.
    pub default_version: &'static str,
}

/// Rust protoc plugins installable via cargo.
pub const CARGO_PLUGINS: &[CargoPlugin] = &[
    CargoPlugin {
        name: "protoc-gen-prost",
        crate_name: "protoc-gen-prost",
        binary: "protoc-gen-prost",
        default_version: "0.2.3",
    },
    CargoPlugin {
        name: "protoc-gen-tonic",
        crate_name: "protoc-gen-tonic",
        binary: "protoc-gen-tonic",
        default_version: "0.4.0",
    },
    CargoPlugin {
        name: "protobuf-codegen",
        crate_name: "protobuf-codegen",
        binary: "protoc-gen-rust",
        default_version: "3.4.0",
    },
];

/// One npm-installable plugin.
#[derive(Debug, Clone, Copy)]
pub struct NodePlugin {
    /// Catalogue key.
    pub name: &'static str,
    /// The npm package to install.
    pub package: &'static str,
    /// The binary / console entry point the package provides.
    pub binary: &'static str,
    /// Pinned default version.
    pub default_version: &'static str,
}

/// TypeScript / JavaScript protoc plugins installable via node package
/// managers.
pub const NODE_PLUGINS: &[NodePlugin] = &[
    NodePlugin {
        name: "ts-proto",
        package: "ts-proto",
        binary: "protoc-gen-ts_proto",
        default_version: "2.7.2",
    },
    NodePlugin {
        name: "protoc-gen-es",
        package: "@bufbuild/protoc-gen-es",
        binary: "protoc-gen-es",
        default_version: "1.10.0",
    },
    NodePlugin {
        name: "protoc-gen-connect-es",
        package: "@connectrpc/protoc-gen-connect-es",
        binary: "protoc-gen-connect-es",
        default_version: "1.6.1",
    },
    NodePlugin {
        name: "protoc-gen-grpc-web",
        package: "grpc-web",
        binary: "protoc-gen-grpc-web",
        default_version: "1.5.0",
    },
];

/// Look up a cargo plugin by catalogue key.
#[must_use]
pub fn cargo_plugin(name: &str) -> Option<&'static CargoPlugin> {
    CARGO_PLUGINS.iter().find(|p| p.name == name)
}

/// Look up a node plugin by catalogue key.
#[must_use]
pub fn node_plugin(name: &str) -> Option<&'static NodePlugin> {
    NODE_PLUGINS.iter().find(|p| p.name == name)
}

/// A named set of plugins resolved atomically as a group.
#[derive(Debug, Clone, Copy)]
pub struct Bundle {
    /// Bundle name.
    pub name: &'static str,
    /// Catalogue keys of the member plugins.
    pub plugins: &'static [&'static str],
}

/// Curated plugin bundles.
pub const BUNDLES: &[Bundle] = &[
    Bundle {
        name: "rust-grpc",
        plugins: &["protoc-gen-prost", "protoc-gen-tonic"],
    },
    Bundle {
        name: "typescript-web",
        plugins: &["ts-proto", "protoc-gen-es", "protoc-gen-grpc-web"],
    },
];

/// Look up a bundle by name.
#[must_use]
pub fn bundle(name: &str) -> Option<&'static Bundle> {
    BUNDLES.iter().find(|b| b.name == name)
}
