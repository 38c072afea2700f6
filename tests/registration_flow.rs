//! End-to-end registration scenario against the in-memory registry:
//! update trusted measurements, fetch a real attestation over TCP (and
//! through the relay), register, retire, re-register with a fresh key.

use enclave_relay::enclave::EnclaveServer;
use enclave_relay::registry::{CapabilityToken, MemoryRegistry, RegistryClient};
use enclave_relay::relay::Relay;
use enclave_relay::rpc::RpcHandler;
use enclave_relay::server::{serve_tcp, AppState};
use enclave_relay::workflow::RegistrationFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const CAP: &str = "0xoperator-cap";

async fn spawn_enclave() -> (Arc<EnclaveServer>, String) {
    let enclave = Arc::new(EnclaveServer::new().unwrap());
    let state = Arc::new(AppState {
        rpc_handler: RpcHandler::new(Arc::clone(&enclave)),
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(serve_tcp(state, listener));
    (enclave, addr)
}

fn flow(registry: Arc<MemoryRegistry>, endpoint: String) -> RegistrationFlow {
    RegistrationFlow::new(
        registry,
        endpoint,
        CapabilityToken::new(CAP),
        Duration::from_secs(10),
    )
}

#[tokio::test]
async fn test_full_lifecycle_update_register_retire_rotate() {
    let registry = Arc::new(MemoryRegistry::new(CapabilityToken::new(CAP)));

    // First enclave boot: key K1.
    let (enclave1, endpoint1) = spawn_enclave().await;
    let measurements = enclave1.measurements().clone();

    let mut first = flow(Arc::clone(&registry), endpoint1);
    first.update_trusted_measurements(&measurements).await.unwrap();
    let doc1 = first.fetch_attestation().await.unwrap().clone();
    assert_eq!(doc1.public_key, enclave1.public_key());
    let r1 = first.register().await.unwrap();

    let record1 = registry.registration(&r1).await.unwrap().unwrap();
    assert!(record1.active);
    assert_eq!(record1.public_key, enclave1.public_key());
    assert_eq!(record1.measurements, measurements);

    // Explicit retire flips the record inactive, nothing is deleted.
    first.retire(&r1).await.unwrap();
    let record1 = registry.registration(&r1).await.unwrap().unwrap();
    assert!(!record1.active);

    // Second enclave boot: same image (same measurements), fresh key K2.
    let (enclave2, endpoint2) = spawn_enclave().await;
    assert_eq!(enclave2.measurements(), &measurements);
    assert_ne!(enclave2.public_key(), enclave1.public_key());

    let mut second = flow(Arc::clone(&registry), endpoint2);
    let r2 = second.run(None, None).await.unwrap();
    assert_ne!(r1, r2);

    let record2 = registry.registration(&r2).await.unwrap().unwrap();
    assert!(record2.active);
    assert_eq!(record2.public_key, enclave2.public_key());

    // R2 is independent of the retired R1.
    assert!(!registry.registration(&r1).await.unwrap().unwrap().active);
    assert_eq!(registry.active_registrations(), 1);
    assert_eq!(registry.total_registrations(), 2);
}

#[tokio::test]
async fn test_registration_through_forwarding_relay() {
    // The submission client reaches the enclave endpoint only through a
    // configured relay route; the route is the trust boundary.
    let registry = Arc::new(MemoryRegistry::new(CapabilityToken::new(CAP)));
    let (enclave, enclave_addr) = spawn_enclave().await;

    let route = format!("tcp:127.0.0.1:0=tcp:{}", enclave_addr).parse().unwrap();
    let relay = Relay::bind(vec![route]).await.unwrap();
    let relay_addr = relay.listen_addrs()[0].unwrap().to_string();
    tokio::spawn(relay.serve());

    let mut flow = flow(Arc::clone(&registry), relay_addr);
    let id = flow
        .run(Some(&enclave.measurements().clone()), None)
        .await
        .unwrap();

    let record = registry.registration(&id).await.unwrap().unwrap();
    assert!(record.active);
    assert_eq!(record.public_key, enclave.public_key());
}

#[tokio::test]
async fn test_rotation_window_failure_recovers_by_rerun() {
    // Retire succeeds, then registration is rejected (stale trusted
    // config): zero active registrations remain. Re-running the
    // registration step from a fresh flow recovers.
    let registry = Arc::new(MemoryRegistry::new(CapabilityToken::new(CAP)));
    let (enclave, endpoint) = spawn_enclave().await;
    let good = enclave.measurements().clone();

    let mut first = flow(Arc::clone(&registry), endpoint.clone());
    let old_id = first.run(Some(&good), None).await.unwrap();

    // Operator pushes a wrong trusted config, then rotates: retire lands,
    // register is rejected.
    let bad = enclave_relay::measurements::MeasurementSet::new(&[9; 48], &[9; 48], &[9; 48])
        .unwrap();
    registry
        .update_measurements(&CapabilityToken::new(CAP), &bad)
        .await
        .unwrap();

    let mut rotation = flow(Arc::clone(&registry), endpoint.clone());
    let err = rotation.run(None, Some(&old_id)).await.unwrap_err();
    assert_eq!(err.exit_code(), 3);
    assert_eq!(registry.active_registrations(), 0);

    // Recovery: re-derive state, fix the trusted config, re-run just the
    // registration step.
    registry
        .update_measurements(&CapabilityToken::new(CAP), &good)
        .await
        .unwrap();
    let mut recovery = flow(Arc::clone(&registry), endpoint);
    let new_id = recovery.run(None, Some(&old_id)).await.unwrap();
    assert_ne!(new_id, old_id);
    assert_eq!(registry.active_registrations(), 1);
}
