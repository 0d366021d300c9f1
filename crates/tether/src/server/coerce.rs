//! Argument coercion.
//!
//! Clients send loosely typed values; members declare [`ValueKind`]s. Before
//! a member runs, each argument is converted to its declared kind or the
//! call is refused with a `BadArguments` exception.

use std::time::Duration;

use tether_wire::RemoteError;
use tether_wire::Value;
use uuid::Uuid;

use crate::object::ServerValue;
use crate::object::ValueKind;

/// Coerces a full argument list against declared parameter kinds.
pub fn coerce_args(args: Vec<ServerValue>, params: &[ValueKind]) -> Result<Vec<ServerValue>, RemoteError> {
    if args.len() != params.len() {
        return Err(RemoteError::bad_arguments(format!(
            "expected {} argument(s), got {}",
            params.len(),
            args.len()
        )));
    }
    args.into_iter()
        .zip(params)
        .enumerate()
        .map(|(i, (arg, kind))| {
            coerce(arg, kind).map_err(|e| RemoteError::bad_arguments(format!("argument {}: {}", i, e.message)))
        })
        .collect()
}

/// Converts one value to `kind`.
pub fn coerce(value: ServerValue, kind: &ValueKind) -> Result<ServerValue, RemoteError> {
    let mismatch = |value: &ServerValue| {
        RemoteError::bad_arguments(format!("cannot convert {} to {:?}", value.kind_name(), kind))
    };

    match (kind, value) {
        (ValueKind::Any, v) => Ok(v),
        (
            ValueKind::Str | ValueKind::Object | ValueKind::Bytes | ValueKind::List | ValueKind::Map,
            Value::Null,
        ) => Ok(Value::Null),

        (ValueKind::Bool, v @ Value::Bool(_)) => Ok(v),
        (ValueKind::Int, v @ Value::Int(_)) => Ok(v),
        (ValueKind::Float, v @ Value::Float(_)) => Ok(v),
        (ValueKind::Float, Value::Int(i)) => Ok(Value::Float(i as f64)),
        (ValueKind::Str, v @ Value::Str(_)) => Ok(v),
        (ValueKind::Bytes, v @ Value::Bytes(_)) => Ok(v),
        (ValueKind::List, v @ Value::List(_)) => Ok(v),
        (ValueKind::Map, v @ Value::Map(_)) => Ok(v),
        (ValueKind::Object, v @ Value::Object(_)) => Ok(v),

        (ValueKind::Uuid, v @ Value::Uuid(_)) => Ok(v),
        (ValueKind::Uuid, Value::Str(s)) => Uuid::parse_str(s.trim())
            .map(Value::Uuid)
            .map_err(|_| RemoteError::bad_arguments(format!("'{}' is not a UUID", s))),

        (ValueKind::Duration, v @ Value::Duration(_)) => Ok(v),
        (ValueKind::Duration, Value::Str(s)) => parse_duration(&s)
            .map(Value::Duration)
            .ok_or_else(|| RemoteError::bad_arguments(format!("'{}' is not a duration", s))),
        (ValueKind::Duration, Value::Int(secs)) if secs >= 0 => Ok(Value::Duration(Duration::from_secs(secs as u64))),
        (ValueKind::Duration, Value::Float(secs)) => Duration::try_from_secs_f64(secs)
            .map(Value::Duration)
            .map_err(|_| RemoteError::bad_arguments(format!("{} seconds is not a duration", secs))),

        (ValueKind::Enum(names), Value::Str(s)) => enum_by_name(names, &s)
            .map(|i| Value::Int(i as i64))
            .ok_or_else(|| RemoteError::bad_arguments(format!("'{}' is not one of {:?}", s, names))),
        (ValueKind::Enum(names), Value::Int(i)) if i >= 0 && (i as usize) < names.len() => Ok(Value::Int(i)),

        (_, v) => Err(mismatch(&v)),
    }
}

fn enum_by_name(names: &[String], wanted: &str) -> Option<usize> {
    names
        .iter()
        .position(|n| n == wanted)
        .or_else(|| names.iter().position(|n| n.eq_ignore_ascii_case(wanted)))
}

/// Parses `[d.]hh:mm:ss[.fffffff]`.
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let mut parts = s.split(':');
    let (head, minutes, seconds) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let (days, hours) = match head.split_once('.') {
        Some((d, h)) => (d.parse::<u64>().ok()?, h.parse::<u64>().ok()?),
        None => (0, head.parse::<u64>().ok()?),
    };
    let minutes = minutes.parse::<u64>().ok()?;
    let (whole, fraction) = match seconds.split_once('.') {
        Some((w, f)) => (w.parse::<u64>().ok()?, f),
        None => (seconds.parse::<u64>().ok()?, ""),
    };
    if hours >= 24 || minutes >= 60 || whole >= 60 {
        return None;
    }
    if fraction.len() > 9 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let nanos = if fraction.is_empty() {
        0
    } else {
        let digits: u32 = fraction.parse().ok()?;
        digits * 10u32.pow(9 - fraction.len() as u32)
    };

    let secs = days
        .checked_mul(86_400)?
        .checked_add(hours * 3600)?
        .checked_add(minutes * 60)?
        .checked_add(whole)?;
    Some(Duration::new(secs, nanos))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enum_kind() -> ValueKind {
        ValueKind::Enum(vec!["Red".into(), "Green".into(), "Blue".into()])
    }

    #[test]
    fn test_int_widens_to_float() {
        assert_eq!(coerce(Value::Int(3), &ValueKind::Float).unwrap(), Value::Float(3.0));
        assert!(coerce(Value::Float(3.5), &ValueKind::Int).is_err());
    }

    #[test]
    fn test_enum_by_name_and_index() {
        assert_eq!(coerce(Value::Str("Green".into()), &enum_kind()).unwrap(), Value::Int(1));
        assert_eq!(coerce(Value::Str("blue".into()), &enum_kind()).unwrap(), Value::Int(2));
        assert_eq!(coerce(Value::Int(0), &enum_kind()).unwrap(), Value::Int(0));
        assert!(coerce(Value::Int(3), &enum_kind()).is_err());
        assert!(coerce(Value::Str("Purple".into()), &enum_kind()).is_err());
    }

    #[test]
    fn test_uuid_from_string() {
        let id = Uuid::new_v4();
        assert_eq!(coerce(Value::Str(id.to_string()), &ValueKind::Uuid).unwrap(), Value::Uuid(id));
        assert!(coerce(Value::Str("nope".into()), &ValueKind::Uuid).is_err());
    }

    #[test]
    fn test_duration_forms() {
        let kind = ValueKind::Duration;
        assert_eq!(
            coerce(Value::Str("01:02:03".into()), &kind).unwrap(),
            Value::Duration(Duration::from_secs(3723))
        );
        assert_eq!(
            coerce(Value::Str("2.00:00:01.5".into()), &kind).unwrap(),
            Value::Duration(Duration::new(2 * 86_400 + 1, 500_000_000))
        );
        assert_eq!(coerce(Value::Int(90), &kind).unwrap(), Value::Duration(Duration::from_secs(90)));
        assert_eq!(
            coerce(Value::Float(1.25), &kind).unwrap(),
            Value::Duration(Duration::from_millis(1250))
        );
        assert!(coerce(Value::Str("25:00:00".into()), &kind).is_err());
        assert!(coerce(Value::Int(-1), &kind).is_err());
    }

    #[test]
    fn test_null_for_reference_kinds() {
        assert_eq!(coerce(Value::Null, &ValueKind::Str).unwrap(), Value::Null);
        assert_eq!(coerce(Value::Null, &ValueKind::Object).unwrap(), Value::Null);
        assert!(coerce(Value::Null, &ValueKind::Int).is_err());
    }

    #[test]
    fn test_arity_mismatch() {
        let err = coerce_args(vec![Value::Int(1)], &[ValueKind::Int, ValueKind::Int]).unwrap_err();
        assert_eq!(err.kind, tether_wire::RemoteErrorKind::BadArguments);
    }
}
