//! Benchmarks for execution graph construction and maintenance.
//!
//! - Building the graph of a method with many forking paths
//! - Inserting and removing a single instruction
//! - Replacing one instruction by several (one recreate pass)
//! - Liveness queries

extern crate dexscope;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use dexscope::prelude::*;
use std::{fmt::Write, hint::black_box, sync::Arc};

/// A method with `branches` consecutive diamonds on the parameter, giving
/// 2^`branches` paths through the final return.
fn diamonds(branches: usize) -> String {
    let mut smali = String::from(".registers 3\nconst/4 v0, 0x0\n");
    for index in 0..branches {
        writeln!(smali, "if-eqz v2, :join{index}").unwrap();
        smali.push_str("add-int/lit8 v0, v0, 0x1\n");
        writeln!(smali, ":join{index}").unwrap();
        smali.push_str("add-int/lit8 v1, v0, 0x2\n");
    }
    smali.push_str("return v0\n");
    smali
}

fn setup(smali: &str) -> (Arc<VirtualMachine>, Arc<LocalMethod>, MethodImplementation) {
    let vm = Arc::new(VirtualMachine::new(
        Arc::new(ClassManager::new()),
        VmConfig::default(),
    ));
    let method = Arc::new(LocalMethod::new("Lcom/example/Bench;->run(I)I", 3, true).unwrap());
    let implementation = parse_smali(smali).unwrap();
    (vm, method, implementation)
}

fn bench_build(c: &mut Criterion) {
    let (vm, method, implementation) = setup(&diamonds(8));
    c.bench_function("graph_build_8_diamonds", |b| {
        b.iter(|| {
            let graph = vm.execute(black_box(&method), black_box(&implementation)).unwrap();
            black_box(graph)
        });
    });
}

fn bench_edits(c: &mut Criterion) {
    let (vm, method, implementation) = setup(&diamonds(6));
    let manipulator = || {
        ExecutionGraphManipulator::build(
            Arc::clone(&vm),
            Arc::clone(&method),
            implementation.clone(),
        )
        .unwrap()
    };

    c.bench_function("manipulator_insert_remove", |b| {
        b.iter_batched(
            manipulator,
            |mut manipulator| {
                let location = manipulator.insert_at(1, Instruction::nop()).unwrap();
                manipulator.remove(location).unwrap();
                black_box(manipulator)
            },
            BatchSize::SmallInput,
        );
    });

    c.bench_function("manipulator_replace", |b| {
        b.iter_batched(
            manipulator,
            |mut manipulator| {
                manipulator
                    .replace(
                        0,
                        vec![
                            Instruction::constant(0, 1),
                            Instruction::nop(),
                            Instruction::nop(),
                        ],
                    )
                    .unwrap();
                black_box(manipulator)
            },
            BatchSize::SmallInput,
        );
    });

    let fixed = manipulator();
    c.bench_function("manipulator_available_registers", |b| {
        b.iter(|| black_box(fixed.available_registers(black_box(0)).unwrap()));
    });
}

criterion_group!(benches, bench_build, bench_edits);
criterion_main!(benches);
