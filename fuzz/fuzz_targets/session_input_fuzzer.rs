//! Fuzz target for a responder session fed hostile bytes
//!
//! A responder that has not authenticated anyone must never panic, must never
//! report itself established, and must never deliver application data.

#![no_main]

use dtm_core::{
    DtmIdentity, DtmSession, ParameterRegistry, Role, SessionAction, SessionEvent, SessionSetup,
};
use dtm_harness::{Recorder, SimEnv};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|chunks: Vec<Vec<u8>>| {
    let Some(parameters) = ParameterRegistry::by_name("X4.1") else {
        return;
    };
    let setup =
        SessionSetup::new(Role::Responder, DtmIdentity::new("bob", "bob-secret"), parameters);
    let mut session = DtmSession::new(SimEnv::with_seed(0), setup);
    let mut observer = Recorder::proceeding();

    for chunk in chunks.iter().take(64) {
        for action in session.handle_bytes(chunk, &mut observer) {
            assert!(!matches!(action, SessionAction::Response(_)));
        }
        let _ = session.keepalive_tick(&mut observer);
    }

    assert!(!session.is_established());
    assert_eq!(observer.count(|event| matches!(event, SessionEvent::DataReceived { .. })), 0);
});
