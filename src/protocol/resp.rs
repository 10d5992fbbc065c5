use bytes::Bytes;

/// A decoded RESP3 value.
///
/// Aggregates keep their children in wire order; maps preserve insertion
/// order. Attributes are attached to the value they precede and are
/// observable through [`RespValue::attributes`] without affecting equality.
#[derive(Debug, Clone)]
pub enum RespValue {
    SimpleString(Bytes),
    Error(Bytes),
    Integer(i64),
    BulkString(Bytes),
    BlobError(Bytes),
    VerbatimString { format: [u8; 3], data: Bytes },
    BigNumber(Bytes),
    /// Double keeps the raw textual form so replies stay bit-exact.
    Double(Bytes),
    Boolean(bool),
    Null,
    Array(Vec<RespValue>),
    Set(Vec<RespValue>),
    Map(Vec<(RespValue, RespValue)>),
    Push(Vec<RespValue>),
    Attributed {
        attrs: Vec<(RespValue, RespValue)>,
        value: Box<RespValue>,
    },
}

impl RespValue {
    pub fn simple<T: AsRef<[u8]>>(value: T) -> Self {
        RespValue::SimpleString(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn error<T: AsRef<[u8]>>(value: T) -> Self {
        RespValue::Error(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn bulk<T: AsRef<[u8]>>(value: T) -> Self {
        RespValue::BulkString(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    /// The value with any attribute wrapper peeled off.
    pub fn payload(&self) -> &RespValue {
        match self {
            RespValue::Attributed { value, .. } => value.payload(),
            other => other,
        }
    }

    /// Consume the value, discarding any attached attributes.
    pub fn into_payload(self) -> RespValue {
        match self {
            RespValue::Attributed { value, .. } => value.into_payload(),
            other => other,
        }
    }

    /// Attributes attached to this value, if any.
    pub fn attributes(&self) -> Option<&[(RespValue, RespValue)]> {
        match self {
            RespValue::Attributed { attrs, .. } => Some(attrs),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self.payload(),
            RespValue::Error(_) | RespValue::BlobError(_)
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self.payload(), RespValue::Null)
    }

    /// Error payload for `Error` and `BlobError` frames.
    pub fn error_text(&self) -> Option<&Bytes> {
        match self.payload() {
            RespValue::Error(data) | RespValue::BlobError(data) => Some(data),
            _ => None,
        }
    }

    /// Raw bytes of string-like frames.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self.payload() {
            RespValue::SimpleString(data)
            | RespValue::BulkString(data)
            | RespValue::BigNumber(data)
            | RespValue::Double(data) => Some(data),
            RespValue::VerbatimString { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Integer view: an `Integer` frame, or a string frame parsing as i64.
    pub fn as_int(&self) -> Option<i64> {
        match self.payload() {
            RespValue::Integer(value) => Some(*value),
            RespValue::SimpleString(data) | RespValue::BulkString(data) => {
                std::str::from_utf8(data).ok()?.parse().ok()
            }
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self.payload() {
            RespValue::Array(values)
            | RespValue::Set(values)
            | RespValue::Push(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(RespValue, RespValue)]> {
        match self.payload() {
            RespValue::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Elements of a push frame.
    pub fn push_items(&self) -> Option<&[RespValue]> {
        match self.payload() {
            RespValue::Push(items) => Some(items),
            _ => None,
        }
    }
}

// Attributes are metadata: two values compare equal when their payloads do.
impl PartialEq for RespValue {
    fn eq(&self, other: &Self) -> bool {
        match (self.payload(), other.payload()) {
            (RespValue::SimpleString(a), RespValue::SimpleString(b)) => a == b,
            (RespValue::Error(a), RespValue::Error(b)) => a == b,
            (RespValue::Integer(a), RespValue::Integer(b)) => a == b,
            (RespValue::BulkString(a), RespValue::BulkString(b)) => a == b,
            (RespValue::BlobError(a), RespValue::BlobError(b)) => a == b,
            (
                RespValue::VerbatimString { format: fa, data: da },
                RespValue::VerbatimString { format: fb, data: db },
            ) => fa == fb && da == db,
            (RespValue::BigNumber(a), RespValue::BigNumber(b)) => a == b,
            (RespValue::Double(a), RespValue::Double(b)) => a == b,
            (RespValue::Boolean(a), RespValue::Boolean(b)) => a == b,
            (RespValue::Null, RespValue::Null) => true,
            (RespValue::Array(a), RespValue::Array(b)) => a == b,
            (RespValue::Set(a), RespValue::Set(b)) => a == b,
            (RespValue::Map(a), RespValue::Map(b)) => a == b,
            (RespValue::Push(a), RespValue::Push(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for RespValue {}

#[cfg(test)]
mod tests {
    use super::RespValue;
    use bytes::Bytes;

    #[test]
    fn attributes_do_not_affect_identity() {
        let plain = RespValue::bulk("value");
        let attributed = RespValue::Attributed {
            attrs: vec![(RespValue::simple("ttl"), RespValue::Integer(30))],
            value: Box::new(RespValue::bulk("value")),
        };
        assert_eq!(plain, attributed);
        assert!(attributed.attributes().is_some());
        assert!(plain.attributes().is_none());
    }

    #[test]
    fn empty_bulk_is_not_null() {
        let empty = RespValue::BulkString(Bytes::new());
        assert_ne!(empty, RespValue::Null);
        assert!(!empty.is_null());
    }

    #[test]
    fn empty_map_is_not_null() {
        let empty = RespValue::Map(Vec::new());
        assert_ne!(empty, RespValue::Null);
        assert_eq!(empty.as_map(), Some(&[][..]));
    }

    #[test]
    fn int_view_parses_string_frames() {
        assert_eq!(RespValue::bulk("42").as_int(), Some(42));
        assert_eq!(RespValue::Integer(-7).as_int(), Some(-7));
        assert_eq!(RespValue::bulk("nope").as_int(), None);
    }
}
