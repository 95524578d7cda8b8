//! Compile-time method descriptions.
//!
//! The runtime does not reflect over user types; instead every callable
//! method is described by a [`Method`] impl: its wire name, its argument
//! and reply types, and a structural signature hash both peers derive
//! independently. A hash mismatch means the two sides were built against
//! different signatures and the server rejects the call before decoding
//! arguments.

use serde::de::DeserializeOwned;
use serde::Serialize;
use type_hash::TypeHash;

/// One remotely callable method.
///
/// ```
/// use serde::Serialize;
/// use type_hash::TypeHash;
///
/// #[derive(Serialize, TypeHash)]
/// struct AddArgs {
///     a: u32,
///     b: u32,
/// }
///
/// struct Add;
///
/// impl rhea::Method for Add {
///     const NAME: &'static str = "add";
///     type Args = AddArgs;
///     type Reply = u32;
/// }
/// ```
pub trait Method {
    /// Wire name of the method.
    const NAME: &'static str;

    /// Argument aggregate, encoded by reference into the request.
    type Args: Serialize + TypeHash + Send;

    /// Return value decoded from the response.
    type Reply: DeserializeOwned + TypeHash + Send + 'static;

    /// Structural hash of the method signature. Folds the argument and
    /// reply type hashes asymmetrically so `fn(A) -> B` and `fn(B) -> A`
    /// disagree.
    fn signature_hash() -> u64 {
        Self::Args::type_hash().rotate_left(1) ^ Self::Reply::type_hash()
    }
}
