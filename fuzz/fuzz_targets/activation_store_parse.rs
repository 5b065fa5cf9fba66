#![no_main]

use libfuzzer_sys::fuzz_target;
use qnet_activation::record::{ActivationRecord, PendingActivation};

fuzz_target!(|data: &[u8]| {
    // Entries read back from activations.json must never panic.
    if let Ok(pending) = serde_json::from_slice::<PendingActivation>(data) {
        let _ = pending.state.is_terminal();
        let _ = pending.state.name();
    }
    let _ = serde_json::from_slice::<ActivationRecord>(data);
});
