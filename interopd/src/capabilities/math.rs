// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use serde_json::{Number, Value};

use super::{number_arg, Arity, CallContext, Capability, Fault};

/// Largest accepted `factorial` argument.
pub const MAX_FACTORIAL: u64 = 20_000;

const LIMB_BASE: u64 = 1_000_000_000;

pub fn capability(init: Option<&Value>) -> anyhow::Result<Capability> {
    if let Some(init) = init {
        if !init.is_null() && init.as_object().map_or(true, |o| !o.is_empty()) {
            anyhow::bail!("math takes no init options, got {init}");
        }
    }
    Ok(Capability::new("math")
        .method("add", Arity::AtLeast(0), |args, _| Ok(add(&args)?))
        .method("factorial", Arity::Exact(1), factorial)
        .attribute("pi", Value::from(std::f64::consts::PI)))
}

fn add(args: &[Value]) -> Result<Value, Fault> {
    if args.iter().all(|v| v.is_i64() || v.is_u64()) {
        let mut sum: i128 = 0;
        for v in args {
            let n = v
                .as_i64()
                .map(i128::from)
                .or_else(|| v.as_u64().map(i128::from))
                .unwrap_or_default();
            sum = sum
                .checked_add(n)
                .ok_or_else(|| Fault::overflow("integer sum out of range"))?;
        }
        return integer_value(sum);
    }

    let mut sum = 0.0;
    for index in 0..args.len() {
        sum += number_arg(args, index, "add")?;
    }
    Number::from_f64(sum)
        .map(Value::Number)
        .ok_or_else(|| Fault::overflow("float sum is not finite"))
}

fn integer_value(n: i128) -> Result<Value, Fault> {
    if let Ok(n) = i64::try_from(n) {
        Ok(Value::from(n))
    } else if let Ok(n) = u64::try_from(n) {
        Ok(Value::from(n))
    } else {
        Err(Fault::overflow("integer sum out of range"))
    }
}

fn factorial(args: Vec<Value>, ctx: &CallContext<'_>) -> anyhow::Result<Value> {
    let arg = args
        .first()
        .ok_or_else(|| Fault::type_error("factorial() takes exactly one argument (0 given)"))?;
    let n = match arg {
        v if v.as_i64().is_some_and(|n| n < 0) => {
            return Err(Fault::value_error("factorial() not defined for negative values").into())
        }
        v => v
            .as_u64()
            .ok_or_else(|| Fault::value_error("factorial() only accepts integral values"))?,
    };
    if n > MAX_FACTORIAL {
        return Err(Fault::value_error(format!("factorial() argument exceeds {MAX_FACTORIAL}")).into());
    }

    // little-endian base 10^9 limbs
    let mut limbs: Vec<u64> = vec![1];
    for k in 2..=n {
        if k % 512 == 0 {
            ctx.probe().checkpoint()?;
        }
        let mut carry = 0;
        for limb in limbs.iter_mut() {
            let x = *limb * k + carry;
            *limb = x % LIMB_BASE;
            carry = x / LIMB_BASE;
        }
        while carry > 0 {
            limbs.push(carry % LIMB_BASE);
            carry /= LIMB_BASE;
        }
    }

    let mut digits = String::with_capacity(limbs.len() * 9);
    let mut rev = limbs.iter().rev();
    if let Some(head) = rev.next() {
        digits.push_str(&head.to_string());
    }
    for limb in rev {
        digits.push_str(&format!("{limb:09}"));
    }
    Ok(Value::String(digits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Member;
    use crate::job_engine::probe::WorkerSignals;
    use crate::job_engine::CancelProbe;
    use serde_json::json;

    fn call(name: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        let signals = WorkerSignals::new(0);
        let probe = CancelProbe::new(&signals);
        let ctx = CallContext::new(&probe);
        let math = capability(None).unwrap();
        match math.member(name) {
            Some(Member::Method(m)) => m.call(args, &ctx),
            other => panic!("{name} is not a method: {other:?}"),
        }
    }

    fn fault(err: anyhow::Error) -> Fault {
        err.downcast::<Fault>().expect("capability fault")
    }

    #[test]
    fn add_integers_and_floats() {
        assert_eq!(call("add", vec![json!(2), json!(3)]).unwrap(), json!(5));
        assert_eq!(call("add", vec![]).unwrap(), json!(0));
        assert_eq!(call("add", vec![json!(1), json!(0.5)]).unwrap(), json!(1.5));
        assert_eq!(
            call("add", vec![json!(u64::MAX), json!(-1)]).unwrap(),
            json!(u64::MAX - 1)
        );
    }

    #[test]
    fn add_rejects_non_numbers_and_overflow() {
        let err = fault(call("add", vec![json!(1), json!("x")]).unwrap_err());
        assert_eq!(err.kind, "TypeError");

        let err = fault(call("add", vec![json!(u64::MAX), json!(u64::MAX)]).unwrap_err());
        assert_eq!(err.kind, "OverflowError");
    }

    #[test]
    fn factorial_is_exact() {
        assert_eq!(call("factorial", vec![json!(0)]).unwrap(), json!("1"));
        assert_eq!(call("factorial", vec![json!(5)]).unwrap(), json!("120"));
        assert_eq!(
            call("factorial", vec![json!(25)]).unwrap(),
            json!("15511210043330985984000000")
        );
    }

    #[test]
    fn factorial_rejects_bad_input() {
        for arg in [json!(-1), json!(2.5), json!("3"), json!(MAX_FACTORIAL + 1)] {
            let err = fault(call("factorial", vec![arg]).unwrap_err());
            assert_eq!(err.kind, "ValueError");
        }
    }

    #[test]
    fn factorial_without_argument_is_a_fault() {
        let signals = WorkerSignals::new(0);
        let probe = CancelProbe::new(&signals);
        let err = factorial(vec![], &CallContext::new(&probe)).unwrap_err();
        assert_eq!(fault(err).kind, "TypeError");
    }

    #[test]
    fn factorial_stops_when_cancelled() {
        let signals = WorkerSignals::new(0);
        signals.cancel();
        let probe = CancelProbe::new(&signals);
        let err = factorial(vec![json!(MAX_FACTORIAL)], &CallContext::new(&probe)).unwrap_err();
        assert!(crate::job_engine::error::interruption(&err).is_some());
    }

    #[test]
    fn init_options_are_rejected() {
        assert!(capability(Some(&json!({}))).is_ok());
        assert!(capability(Some(&json!({"precision": 3}))).is_err());
    }
}
