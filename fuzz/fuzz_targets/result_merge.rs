#![no_main]

use std::collections::HashSet;

use libfuzzer_sys::fuzz_target;
use pagecheck_core::merge::{merge_results, retain_recent_runs};
use pagecheck_core::model::{CheckResult, RUNNER_RULE_ID, ResultType, RunId};

const KINDS: [ResultType; 7] = [
    ResultType::Ok,
    ResultType::Warn,
    ResultType::Error,
    ResultType::Info,
    ResultType::RuntimeError,
    ResultType::Pending,
    ResultType::Disabled,
];

fn result_from(bytes: &[u8]) -> CheckResult {
    let [kind, rule, run, flags] = [bytes[0], bytes[1], bytes[2], bytes[3]];
    let rule_id = if flags & 0x10 != 0 {
        RUNNER_RULE_ID.to_string()
    } else {
        format!("rule-{}", rule % 8)
    };
    let mut result = CheckResult::new(KINDS[kind as usize % KINDS.len()], rule_id.clone(), "")
        .with_label(format!("{flags}"));
    if flags & 0x01 == 0 {
        result = result.with_rule_id(rule_id);
    }
    if flags & 0x02 == 0 {
        result = result.with_run_id(RunId(format!("run-{}", run % 5)));
    }
    result
}

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    let split = data[0] as usize % data.len();
    let keep = usize::from(data[1] % 6) + 1;
    let (previous, incoming) = data[2..].split_at(split.min(data.len() - 2));
    let previous: Vec<CheckResult> = previous.chunks_exact(4).map(result_from).collect();
    let incoming: Vec<CheckResult> = incoming.chunks_exact(4).map(result_from).collect();

    let merged = merge_results(&merge_results(&[], &previous), &incoming);
    let mut keys = HashSet::new();
    for result in &merged {
        assert!(
            keys.insert((result.identity().to_string(), result.run_id.clone())),
            "duplicate key after merge"
        );
    }

    let kept = retain_recent_runs(&merged, keep);
    let runs: HashSet<_> = kept.iter().filter_map(|r| r.run_id.clone()).collect();
    assert!(runs.len() <= keep);
    assert!(kept.len() <= merged.len());
});
