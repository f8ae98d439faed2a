use std::borrow::Borrow;
use std::error;
use std::fmt;
use std::ops::Deref;

use crate::proto::Type;

/// The maximum length of a signature in bytes.
pub(crate) const MAX_SIGNATURE: usize = 255;

/// The maximum individual container depth.
pub(crate) const MAX_CONTAINER_DEPTH: usize = 32;

/// A validated D-Bus signature.
///
/// This is an unsized wrapper over a string which is known to contain a
/// well-formed sequence of single complete types.
#[derive(PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Signature(str);

impl Signature {
    /// Construct a new validated signature.
    ///
    /// # Errors
    ///
    /// Errors if the signature is malformed.
    ///
    /// # Examples
    ///
    /// ```
    /// use wirebus::Signature;
    ///
    /// assert!(Signature::new("a{sv}").is_ok());
    /// assert!(Signature::new("a{s").is_err());
    /// ```
    pub fn new(signature: &str) -> Result<&Signature, SignatureError> {
        validate(signature.as_bytes())?;
        Ok(Signature::new_unchecked(signature))
    }

    /// The empty signature.
    pub fn empty() -> &'static Signature {
        Signature::new_unchecked("")
    }

    #[inline]
    pub(crate) fn new_unchecked(signature: &str) -> &Signature {
        // SAFETY: Signature is repr(transparent) over str.
        unsafe { &*(signature as *const str as *const Signature) }
    }

    /// Get the signature as a string.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the signature as a byte slice, without a trailing NUL.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Test if the signature is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The length of the signature in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate over the single complete types of the signature.
    ///
    /// # Examples
    ///
    /// ```
    /// use wirebus::Signature;
    ///
    /// let s = Signature::new("ua(ss)a{sv}")?;
    /// let types = s.iter().map(|s| s.as_str()).collect::<Vec<_>>();
    /// assert_eq!(types, ["u", "a(ss)", "a{sv}"]);
    /// # Ok::<_, wirebus::SignatureError>(())
    /// ```
    pub fn iter(&self) -> SignatureIter<'_> {
        SignatureIter { rest: self }
    }

    /// Split off the first single complete type, returning its structural
    /// view and the remainder of the signature.
    pub(crate) fn split_first(&self) -> Option<(TypeView<'_>, &Signature)> {
        let bytes = self.0.as_bytes();
        let first = *bytes.first()?;
        let len = complete_type_len(bytes);
        let (head, rest) = self.0.split_at(len);
        let rest = Signature::new_unchecked(rest);

        let view = match first {
            b'a' => {
                let element = Signature::new_unchecked(&head[1..]);

                if head.as_bytes()[1] == b'{' {
                    let inner = &head[2..head.len() - 1];
                    let key_len = complete_type_len(inner.as_bytes());
                    let (key, value) = inner.split_at(key_len);

                    TypeView::Dict(
                        element,
                        Signature::new_unchecked(key),
                        Signature::new_unchecked(value),
                    )
                } else {
                    TypeView::Array(element)
                }
            }
            b'(' => TypeView::Struct(Signature::new_unchecked(&head[1..head.len() - 1])),
            b'v' => TypeView::Variant,
            code => TypeView::Basic(Type(code)),
        };

        Some((view, rest))
    }
}

/// A structural view of the first single complete type of a signature.
#[derive(Debug, Clone, Copy)]
pub(crate) enum TypeView<'a> {
    /// A basic (fixed or string-like) type.
    Basic(Type),
    /// A variant.
    Variant,
    /// An array carrying its element signature.
    Array(&'a Signature),
    /// A dict (array of dict entries) carrying the full element signature
    /// and the key/value signatures.
    Dict(&'a Signature, &'a Signature, &'a Signature),
    /// A struct carrying its concatenated field signatures.
    Struct(&'a Signature),
}

/// An iterator over the single complete types of a [`Signature`].
pub struct SignatureIter<'a> {
    rest: &'a Signature,
}

impl<'a> Iterator for SignatureIter<'a> {
    type Item = &'a Signature;

    fn next(&mut self) -> Option<Self::Item> {
        let bytes = self.rest.as_bytes();

        if bytes.is_empty() {
            return None;
        }

        let len = complete_type_len(bytes);
        let (head, rest) = self.rest.as_str().split_at(len);
        self.rest = Signature::new_unchecked(rest);
        Some(Signature::new_unchecked(head))
    }
}

impl fmt::Debug for Signature {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Signature {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl PartialEq<str> for Signature {
    #[inline]
    fn eq(&self, other: &str) -> bool {
        self.0 == *other
    }
}

impl PartialEq<Signature> for str {
    #[inline]
    fn eq(&self, other: &Signature) -> bool {
        *self == other.0
    }
}

impl ToOwned for Signature {
    type Owned = SignatureBuf;

    #[inline]
    fn to_owned(&self) -> SignatureBuf {
        SignatureBuf(self.0.to_owned())
    }
}

/// An owned validated D-Bus signature.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SignatureBuf(String);

impl SignatureBuf {
    /// Construct a new owned signature.
    ///
    /// # Errors
    ///
    /// Errors if the signature is malformed.
    pub fn new(signature: &str) -> Result<SignatureBuf, SignatureError> {
        validate(signature.as_bytes())?;
        Ok(Self(signature.to_owned()))
    }

    /// The empty signature.
    pub fn empty() -> SignatureBuf {
        Self(String::new())
    }

    #[inline]
    pub(crate) fn from_string_unchecked(signature: String) -> SignatureBuf {
        Self(signature)
    }
}

impl Deref for SignatureBuf {
    type Target = Signature;

    #[inline]
    fn deref(&self) -> &Self::Target {
        Signature::new_unchecked(&self.0)
    }
}

impl Borrow<Signature> for SignatureBuf {
    #[inline]
    fn borrow(&self) -> &Signature {
        self
    }
}

impl From<&Signature> for SignatureBuf {
    #[inline]
    fn from(signature: &Signature) -> Self {
        signature.to_owned()
    }
}

impl fmt::Debug for SignatureBuf {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for SignatureBuf {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl PartialEq<Signature> for SignatureBuf {
    #[inline]
    fn eq(&self, other: &Signature) -> bool {
        self.0 == other.0
    }
}

impl PartialEq<SignatureBuf> for Signature {
    #[inline]
    fn eq(&self, other: &SignatureBuf) -> bool {
        self.0 == *other.0
    }
}

impl PartialEq<str> for SignatureBuf {
    #[inline]
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for SignatureBuf {
    #[inline]
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// The length in bytes of the first single complete type of a valid
/// signature.
pub(crate) fn complete_type_len(bytes: &[u8]) -> usize {
    match bytes[0] {
        b'a' => 1 + complete_type_len(&bytes[1..]),
        b'(' | b'{' => {
            let mut depth = 1;
            let mut n = 1;

            while depth > 0 {
                match bytes[n] {
                    b'(' | b'{' => depth += 1,
                    b')' | b'}' => depth -= 1,
                    _ => {}
                }

                n += 1;
            }

            n
        }
        _ => 1,
    }
}

/// An error raised when validating a signature.
#[derive(Debug, PartialEq, Eq)]
pub struct SignatureError {
    pub(crate) kind: SignatureErrorKind,
}

impl SignatureError {
    #[inline]
    pub(crate) fn new(kind: SignatureErrorKind) -> Self {
        Self { kind }
    }
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use SignatureErrorKind::*;

        match &self.kind {
            SignatureTooLong => write!(f, "Signature is too long"),
            UnknownTypeCode(code) => write!(f, "Unknown type code `{}`", *code as char),
            MissingArrayElementType => write!(f, "Missing array element type"),
            StructEndedButNotStarted => write!(f, "Struct ended but not started"),
            StructStartedButNotEnded => write!(f, "Struct started but not ended"),
            StructHasNoFields => write!(f, "Struct has no fields"),
            DictEndedButNotStarted => write!(f, "Dict ended but not started"),
            DictStartedButNotEnded => write!(f, "Dict started but not ended"),
            DictEntryHasNoFields => write!(f, "Dict entry has no fields"),
            DictEntryHasOnlyOneField => write!(f, "Dict entry has only one field"),
            DictEntryHasTooManyFields => write!(f, "Dict entry has too many fields"),
            DictEntryNotInsideArray => write!(f, "Dict entry not inside array"),
            DictKeyMustBeBasicType => write!(f, "Dict key must be a basic type"),
            ExceededMaximumArrayRecursion => write!(f, "Exceeded maximum array recursion"),
            ExceededMaximumStructRecursion => write!(f, "Exceeded maximum struct recursion"),
            ExceededMaximumDictRecursion => write!(f, "Exceeded maximum dict recursion"),
        }
    }
}

impl error::Error for SignatureError {}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SignatureErrorKind {
    SignatureTooLong,
    UnknownTypeCode(u8),
    MissingArrayElementType,
    StructEndedButNotStarted,
    StructStartedButNotEnded,
    StructHasNoFields,
    DictEndedButNotStarted,
    DictStartedButNotEnded,
    DictEntryHasNoFields,
    DictEntryHasOnlyOneField,
    DictEntryHasTooManyFields,
    DictEntryNotInsideArray,
    DictKeyMustBeBasicType,
    ExceededMaximumArrayRecursion,
    ExceededMaximumStructRecursion,
    ExceededMaximumDictRecursion,
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Array,
    Struct,
    Dict,
}

/// Validate that the given bytes form a well-formed sequence of single
/// complete types.
pub(crate) fn validate(bytes: &[u8]) -> Result<(), SignatureError> {
    use SignatureErrorKind::*;

    if bytes.len() > MAX_SIGNATURE {
        return Err(SignatureError::new(SignatureTooLong));
    }

    let mut stack = Vec::<(Kind, u8)>::new();
    let mut arrays = 0;
    let mut structs = 0;

    for &b in bytes {
        let t = Type(b);

        let mut is_basic = match t {
            Type::BYTE
            | Type::BOOLEAN
            | Type::INT16
            | Type::UINT16
            | Type::INT32
            | Type::UINT32
            | Type::INT64
            | Type::UINT64
            | Type::DOUBLE
            | Type::STRING
            | Type::OBJECT_PATH
            | Type::SIGNATURE
            | Type::UNIX_FD => true,
            Type::VARIANT => false,
            Type::ARRAY => {
                if arrays == MAX_CONTAINER_DEPTH {
                    return Err(SignatureError::new(ExceededMaximumArrayRecursion));
                }

                stack.push((Kind::Array, 0));
                arrays += 1;
                continue;
            }
            Type::OPEN_PAREN => {
                if structs == MAX_CONTAINER_DEPTH {
                    return Err(SignatureError::new(ExceededMaximumStructRecursion));
                }

                stack.push((Kind::Struct, 0));
                structs += 1;
                continue;
            }
            Type::CLOSE_PAREN => {
                let n = match stack.pop() {
                    Some((Kind::Struct, n)) => n,
                    Some((Kind::Array, _)) => {
                        return Err(SignatureError::new(MissingArrayElementType));
                    }
                    _ => {
                        return Err(SignatureError::new(StructEndedButNotStarted));
                    }
                };

                if n == 0 {
                    return Err(SignatureError::new(StructHasNoFields));
                }

                structs -= 1;
                false
            }
            Type::OPEN_BRACE => {
                if stack.len() == MAX_CONTAINER_DEPTH * 2 {
                    return Err(SignatureError::new(ExceededMaximumDictRecursion));
                }

                stack.push((Kind::Dict, 0));
                continue;
            }
            Type::CLOSE_BRACE => {
                let n = match stack.pop() {
                    Some((Kind::Dict, n)) => n,
                    Some((Kind::Array, _)) => {
                        return Err(SignatureError::new(MissingArrayElementType));
                    }
                    _ => {
                        return Err(SignatureError::new(DictEndedButNotStarted));
                    }
                };

                match n {
                    0 => return Err(SignatureError::new(DictEntryHasNoFields)),
                    1 => return Err(SignatureError::new(DictEntryHasOnlyOneField)),
                    2 => {}
                    _ => return Err(SignatureError::new(DictEntryHasTooManyFields)),
                }

                if !matches!(stack.last(), Some((Kind::Array, _))) {
                    return Err(SignatureError::new(DictEntryNotInsideArray));
                }

                false
            }
            Type(code) => return Err(SignatureError::new(UnknownTypeCode(code))),
        };

        // Arrays are completed by the single complete type that follows
        // them.
        while let Some((Kind::Array, _)) = stack.last() {
            stack.pop();
            arrays -= 1;
            is_basic = false;
        }

        if let Some((Kind::Dict, 0)) = stack.last() {
            if !is_basic {
                return Err(SignatureError::new(DictKeyMustBeBasicType));
            }
        }

        if let Some((kind, n)) = stack.pop() {
            stack.push((kind, n + 1));
        }
    }

    match stack.pop() {
        Some((Kind::Array, _)) => Err(SignatureError::new(MissingArrayElementType)),
        Some((Kind::Struct, _)) => Err(SignatureError::new(StructStartedButNotEnded)),
        Some((Kind::Dict, _)) => Err(SignatureError::new(DictStartedButNotEnded)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use SignatureErrorKind::*;

    macro_rules! test {
        ($input:expr, $expected:pat) => {{
            let actual = Signature::new($input).map_err(|e| e.kind);

            assert!(
                matches!(actual, $expected),
                "{actual:?} does not match {}",
                stringify!($expected)
            );
        }};
    }

    #[test]
    fn signature_validation() {
        test!("", Ok(..));
        test!("sss", Ok(..));
        test!("i", Ok(..));
        test!("b", Ok(..));
        test!("ai", Ok(..));
        test!("(i)", Ok(..));
        test!("a{sv}", Ok(..));
        test!("a(ii)a{s(ss)}v", Ok(..));
        test!("w", Err(UnknownTypeCode(..)));
        test!("a", Err(MissingArrayElementType));
        test!("aaaaaa", Err(MissingArrayElementType));
        test!("ii(ii)a", Err(MissingArrayElementType));
        test!("ia", Err(MissingArrayElementType));
        test!(")", Err(StructEndedButNotStarted));
        test!("}", Err(DictEndedButNotStarted));
        test!("i)", Err(StructEndedButNotStarted));
        test!("a)", Err(MissingArrayElementType));
        test!("(", Err(StructStartedButNotEnded));
        test!("(i", Err(StructStartedButNotEnded));
        test!("(ai", Err(StructStartedButNotEnded));
        test!("()", Err(StructHasNoFields));
        test!("(())", Err(StructHasNoFields));
        test!("a()", Err(StructHasNoFields));
        test!("(a)", Err(MissingArrayElementType));
        test!("a{ia}", Err(MissingArrayElementType));
        test!("a{}", Err(DictEntryHasNoFields));
        test!("a{aii}", Err(DictKeyMustBeBasicType));
        test!("a{vi}", Err(DictKeyMustBeBasicType));
        test!("a{(ii)i}", Err(DictKeyMustBeBasicType));
        test!("a{i}", Err(DictEntryHasOnlyOneField));
        test!("{is}", Err(DictEntryNotInsideArray));
        test!("a{isi}", Err(DictEntryHasTooManyFields));
        test!(" ", Err(UnknownTypeCode(..)));
        test!("not a valid signature", Err(UnknownTypeCode(..)));
        test!(".", Err(UnknownTypeCode(..)));
        test!(std::str::from_utf8(&[b'i'; 255]).unwrap(), Ok(..));
        test!(
            std::str::from_utf8(&[b'i'; 256]).unwrap(),
            Err(SignatureTooLong)
        );
    }

    #[test]
    fn array_recursion_limit() {
        let ok = "a".repeat(32) + "i";
        test!(&ok, Ok(..));

        let too_deep = "a".repeat(33) + "i";
        test!(&too_deep, Err(ExceededMaximumArrayRecursion));
    }

    #[test]
    fn struct_recursion_limit() {
        let ok = format!("{}ii{}", "(".repeat(32), ")".repeat(32));
        test!(&ok, Ok(..));

        let too_deep = format!("{}ii{}", "(".repeat(33), ")".repeat(33));
        test!(&too_deep, Err(ExceededMaximumStructRecursion));
    }

    #[test]
    fn complete_types() {
        let s = Signature::new("ua(ss)a{sv}vaay").unwrap();
        let types = s.iter().map(|s| s.as_str()).collect::<Vec<_>>();
        assert_eq!(types, ["u", "a(ss)", "a{sv}", "v", "aay"]);
    }

    #[test]
    fn split_first_views() {
        let s = Signature::new("a{s(ii)}u").unwrap();

        let Some((TypeView::Dict(element, key, value), rest)) = s.split_first() else {
            panic!("expected dict view");
        };

        assert_eq!(element.as_str(), "{s(ii)}");
        assert_eq!(key.as_str(), "s");
        assert_eq!(value.as_str(), "(ii)");
        assert_eq!(rest.as_str(), "u");
    }
}
