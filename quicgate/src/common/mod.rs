// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod address;
pub mod authentication;
pub mod cipher;
pub mod id;
pub mod protocol;

pub use address::{AddressDescriptor, ConnectionType, HostAndPort, ParseError};
pub use authentication::AuthKey;
pub use cipher::CipherKey;
