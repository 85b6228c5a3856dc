use std::time::Duration;

use serde_json::json;

use nodeflow_core::registry::{required_arg, NodeTypeRegistry};

/// Registry with the arithmetic node types available from the command line.
pub fn registry() -> NodeTypeRegistry {
    let mut registry = NodeTypeRegistry::new();

    // ── Arithmetic ──────────────────────────────────────────
    registry.register_sync("add", &["result"], |kw| {
        let a: f64 = required_arg(&kw, "a")?;
        let b: f64 = required_arg(&kw, "b")?;
        Ok(number(a + b))
    });
    registry.register_sync("subtract", &["result"], |kw| {
        let a: f64 = required_arg(&kw, "a")?;
        let b: f64 = required_arg(&kw, "b")?;
        Ok(number(a - b))
    });
    registry.register_sync("multiply", &["result"], |kw| {
        let a: f64 = required_arg(&kw, "a")?;
        let b: f64 = required_arg(&kw, "b")?;
        Ok(number(a * b))
    });
    registry.register_sync("divide", &["result"], |kw| {
        let a: f64 = required_arg(&kw, "a")?;
        let b: f64 = required_arg(&kw, "b")?;
        if b == 0.0 {
            anyhow::bail!("division by zero");
        }
        Ok(number(a / b))
    });

    // ── Multiple outputs ────────────────────────────────────
    registry.register_sync("sum_and_product", &["sum", "product"], |kw| {
        let a: f64 = required_arg(&kw, "a")?;
        let b: f64 = required_arg(&kw, "b")?;
        Ok(json!([number(a + b), number(a * b)]))
    });

    // ── Async ───────────────────────────────────────────────
    registry.register_async("delayed_add", &["result"], |kw| async move {
        let a: f64 = required_arg(&kw, "a")?;
        let b: f64 = required_arg(&kw, "b")?;
        let delay_ms: u64 = kw
            .get("delay_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(100);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok::<_, anyhow::Error>(number(a + b))
    });

    describe(&mut registry, "add", "a + b");
    describe(&mut registry, "subtract", "a - b");
    describe(&mut registry, "multiply", "a * b");
    describe(&mut registry, "divide", "a / b, fails when b is zero");
    describe(&mut registry, "sum_and_product", "a + b and a * b");
    describe(
        &mut registry,
        "delayed_add",
        "a + b after sleeping delay_ms (default 100)",
    );
    registry
}

fn describe(registry: &mut NodeTypeRegistry, type_name: &str, description: &str) {
    if let Some(entry) = registry.get(type_name).cloned() {
        registry.register(entry.with_description(description));
    }
}

/// Whole numbers stay integers in the output.
fn number(x: f64) -> serde_json::Value {
    if x.fract() == 0.0 && x.abs() < i64::MAX as f64 {
        json!(x as i64)
    } else {
        json!(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeflow_core::types::Kwargs;
    use serde_json::Value;

    fn args(a: Value, b: Value) -> Kwargs {
        let mut kw = Kwargs::new();
        kw.insert("a".into(), a);
        kw.insert("b".into(), b);
        kw
    }

    #[tokio::test]
    async fn arithmetic() {
        let registry = registry();
        let call = |name: &str, a, b| {
            let entry = registry.lookup(name).unwrap().clone();
            async move { entry.callable.invoke(args(a, b)).await }
        };
        assert_eq!(call("add", json!(1), json!(2)).await.unwrap(), json!(3));
        assert_eq!(call("subtract", json!(1), json!(2)).await.unwrap(), json!(-1));
        assert_eq!(call("divide", json!(1), json!(4)).await.unwrap(), json!(0.25));
        assert!(call("divide", json!(1), json!(0)).await.is_err());
    }

    #[tokio::test]
    async fn sum_and_product_maps_two_outputs() {
        let entry = registry().lookup("sum_and_product").unwrap().clone();
        let value = entry.callable.invoke(args(json!(2), json!(5))).await.unwrap();
        let mapped = entry.map_outputs(&value);
        assert_eq!(mapped["sum"], json!(7));
        assert_eq!(mapped["product"], json!(10));
    }

    #[test]
    fn every_type_is_described() {
        let registry = registry();
        assert_eq!(registry.len(), 6);
        for name in registry.list() {
            assert!(registry.get(name).unwrap().description.is_some(), "{}", name);
        }
        assert!(registry.get("delayed_add").unwrap().is_async());
    }
}
