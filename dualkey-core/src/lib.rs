//! Redundant key-custody client and the envelope-encryption materials manager built on it.
//!
//! Requests travel as fixed-offset binary frames ([`wire`]) to key-custody endpoints over TCP
//! ([`client`]). Every logical request is raced against two independent endpoints and the first
//! success wins ([`coordinator`]). [`materials`] turns that into the materials-manager contract
//! an envelope-encryption framework consumes.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod key_provider;
pub mod materials;
pub mod rt;
pub mod types;
pub mod wire;

pub use client::{FetchOutcome, KeyFetch, KeyStoreClient, KeyStoreClientBuilder};
pub use config::{CustodyConfig, EndpointConfig, TimeoutConfig};
pub use coordinator::{RedundantFetcher, RedundantSources};
pub use errors::{EndpointFailure, Error, Result, Role};
pub use key_provider::{CustodyKeyWrapper, KeyWrapper};
pub use materials::{
    CryptographicMaterials, CustodyMaterialsManager, DecryptMaterialsRequest,
    EncryptionMaterialsRequest, MaterialDescription, MaterialsManager,
};
pub use types::{Action, ActionDescriptor, KeyLocation, KeySource};
pub use wire::{RequestHeader, WireRequest, WireResponse};
