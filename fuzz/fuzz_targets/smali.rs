#![no_main]

use std::sync::Arc;

use dexscope::prelude::*;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(implementation) = parse_smali(text) else {
        return;
    };
    let registers = implementation.register_count();
    let Ok(method) = LocalMethod::new("LFuzz;->run()V", registers, true) else {
        return;
    };
    let vm = Arc::new(VirtualMachine::new(
        Arc::new(ClassManager::new()),
        VmConfig::new().with_max_method_visits(10_000),
    ));
    let Ok(mut manipulator) = ExecutionGraphManipulator::build(vm, Arc::new(method), implementation)
    else {
        return;
    };
    if manipulator.remove_at(0).is_ok() {
        let _ = manipulator.graph().verify();
        let _ = manipulator.to_smali();
    }
});
