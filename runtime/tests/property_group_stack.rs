//! Property 3: Group stack depth.
//!
//! Depth never goes below zero; `group_end` at depth zero fails with
//! `UnbalancedGroup` and changes nothing; unwinding always returns to zero.

use proptest::prelude::*;
use wasmrepl_runtime::host::{Channel, Console, ConsoleEvent};
use wasmrepl_runtime::RuntimeError;

#[derive(Debug, Clone)]
enum Op {
    Open(String),
    Close,
    Log(String),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        "[a-z]{1,8}".prop_map(Op::Open),
        Just(Op::Close),
        "[a-z ]{0,16}".prop_map(Op::Log),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// The console tracks the same depth as a plain counter model.
    #[test]
    fn depth_matches_model(ops in proptest::collection::vec(arb_op(), 0..64)) {
        let mut console = Console::default();
        let mut model: u32 = 0;

        for op in ops {
            match op {
                Op::Open(label) => {
                    console.open_group(label);
                    model += 1;
                }
                Op::Close => {
                    let result = console.close_group();
                    if model == 0 {
                        prop_assert_eq!(result, Err(RuntimeError::UnbalancedGroup));
                    } else {
                        prop_assert!(result.is_ok());
                        model -= 1;
                    }
                }
                Op::Log(text) => console.message(Channel::Log, text),
            }
            prop_assert_eq!(console.depth(), model);
        }
    }

    /// Messages record the depth they were emitted at.
    #[test]
    fn messages_carry_depth(opens in 0u32..8) {
        let mut console = Console::default();
        for i in 0..opens {
            console.open_group(format!("g{}", i));
        }
        console.message(Channel::Warn, "here".into());
        let last = console.events().last().cloned();
        prop_assert_eq!(
            last,
            Some(ConsoleEvent::Message { channel: Channel::Warn, depth: opens, text: "here".into() })
        );
    }

    /// Unwinding from any state returns to depth zero.
    #[test]
    fn unwind_returns_to_zero(ops in proptest::collection::vec(arb_op(), 0..64)) {
        let mut console = Console::default();
        for op in ops {
            match op {
                Op::Open(label) => console.open_group(label),
                Op::Close => { let _ = console.close_group(); }
                Op::Log(text) => console.message(Channel::Log, text),
            }
        }
        let open = console.depth();
        prop_assert_eq!(console.unwind(), open);
        prop_assert_eq!(console.depth(), 0);
    }
}
