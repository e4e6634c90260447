#![no_main]

use cf_frame::{DataFrame, Row};
use cf_types::Scalar;
use libfuzzer_sys::fuzz_target;

const MAX_FORMULA_BYTES: usize = 1_024;

fn sample_frame() -> DataFrame {
    let rows = [
        (1_i64, 2.5, "a", true),
        (-4, 0.0, "b", false),
        (7, f64::NAN, "", true),
    ]
    .into_iter()
    .map(|(int, float, text, flag)| {
        Row::from([
            ("x".to_owned(), Scalar::Int64(int)),
            ("y".to_owned(), Scalar::Float64(float)),
            ("s".to_owned(), Scalar::Utf8(text.to_owned())),
            ("b".to_owned(), Scalar::Bool(flag)),
        ])
    })
    .collect::<Vec<_>>();
    DataFrame::from_rows(&rows).expect("sample frame")
}

fuzz_target!(|data: &[u8]| {
    if data.len() > MAX_FORMULA_BYTES {
        return;
    }
    let Ok(formula) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(parsed) = cf_expr::parse_formula(formula) else {
        return;
    };

    let frame = sample_frame();
    for expr in &parsed.expressions {
        if let Ok(column) = cf_expr::evaluate_column(expr, &frame) {
            assert_eq!(column.len(), frame.len());
        }
    }
});
