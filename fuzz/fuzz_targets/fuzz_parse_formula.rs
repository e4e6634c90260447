#![no_main]

use libfuzzer_sys::fuzz_target;

const MAX_FORMULA_BYTES: usize = 4_096;

fuzz_target!(|data: &[u8]| {
    if data.len() > MAX_FORMULA_BYTES {
        return;
    }
    let Ok(formula) = std::str::from_utf8(data) else {
        return;
    };

    match cf_expr::parse_formula(formula) {
        Ok(parsed) => {
            assert!(!parsed.expressions.is_empty());
            if let Some(kind) = parsed.aggregation {
                assert_eq!(parsed.expressions.len(), kind.arity());
            }
        }
        Err(cf_expr::ExprError::Parse(err)) => {
            assert!(err.position <= formula.len());
        }
        Err(_) => {}
    }
});
