use anyhow::{bail, Context, Result};

/// Parse a Kubernetes quantity string into its milli-value, the unit all
/// metric arithmetic here is done in: `1` CPU is `1000`, `500m` is `500`,
/// `128Mi` of memory is `128 * 1024 * 1024 * 1000`.
///
/// Sub-milli values round up, matching how the platform scales
/// quantities, so `1n` becomes `1` rather than disappearing.
pub fn parse_milli(input: &str) -> Result<i64> {
    let input = input.trim();
    if input.is_empty() {
        bail!("empty quantity");
    }

    // Plain numbers, including scientific notation like 2e3.
    if let Ok(value) = input.parse::<f64>() {
        return to_milli(value, 1.0, input);
    }

    let (number, factor) = match split_suffix(input) {
        Some(parts) => parts,
        None => bail!("unrecognized quantity {:?}", input),
    };
    let value = number
        .parse::<f64>()
        .with_context(|| format!("unparseable quantity {:?}", input))?;
    to_milli(value, factor, input)
}

fn to_milli(value: f64, factor: f64, input: &str) -> Result<i64> {
    if value < 0.0 {
        bail!("negative quantity {:?}", input);
    }
    let milli = (value * factor * 1000.0).ceil();
    if !milli.is_finite() || milli > i64::MAX as f64 {
        bail!("quantity {:?} out of range", input);
    }
    Ok(milli as i64)
}

fn split_suffix(input: &str) -> Option<(&str, f64)> {
    const BINARY: [(&str, f64); 6] = [
        ("Ki", 1024.0),
        ("Mi", 1048576.0),
        ("Gi", 1073741824.0),
        ("Ti", 1099511627776.0),
        ("Pi", 1125899906842624.0),
        ("Ei", 1152921504606846976.0),
    ];
    const DECIMAL: [(&str, f64); 9] = [
        ("n", 1e-9),
        ("u", 1e-6),
        ("m", 1e-3),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
    ];
    for (suffix, factor) in BINARY {
        if let Some(number) = input.strip_suffix(suffix) {
            return Some((number, factor));
        }
    }
    for (suffix, factor) in DECIMAL {
        if let Some(number) = input.strip_suffix(suffix) {
            return Some((number, factor));
        }
    }
    None
}
