#![no_main]

use libfuzzer_sys::fuzz_target;
use pagecheck_core::bridge::{Envelope, RemoteRequest};
use pagecheck_core::model::{CheckResult, Event};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(envelope) = Envelope::decode(text) {
        // Anything that decodes must survive re-encoding.
        let encoded = envelope.encode().expect("decoded envelope encodes");
        let again = Envelope::decode(&encoded).expect("encoded envelope decodes");
        assert_eq!(envelope.id, again.id);
        assert_eq!(envelope.reply_to, again.reply_to);

        if let Some(payload) = envelope.payload {
            let _ = serde_json::from_value::<RemoteRequest>(payload);
        }
        if let Some(data) = envelope.data {
            let _ = serde_json::from_value::<Vec<CheckResult>>(data.clone());
            let _ = serde_json::from_value::<CheckResult>(data);
        }
    }

    if let Ok(event) = serde_json::from_str::<Event>(text) {
        let _ = event.html();
        let tag = String::from(event.kind.clone());
        assert_eq!(pagecheck_core::model::EventKind::from(tag), event.kind);
    }
});
