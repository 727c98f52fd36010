//! Types both demo programs put on the wire.

use serde::{Deserialize, Serialize};
use subproc_rpc::{Result, TaggedValue, TypeAdvertisement, TypeRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Args {
    pub a: i64,
    pub b: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Flags {
    pub bool_value: bool,
    pub string_value: String,
    pub u32_value: u32,
    pub u16_value: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Args2 {
    pub string_value1: String,
    pub string_value2: String,
    pub flags1: Option<Flags>,
}

/// Status plus an optional polymorphic payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<TaggedValue>,
}

impl Outcome {
    pub const SUCCESS: i32 = 0;
    pub const REMOTE_SYSTEM_ERROR: i32 = 2001;

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            code: Self::SUCCESS,
            message: message.into(),
            data: None,
        }
    }

    pub fn remote_error(message: impl Into<String>) -> Self {
        Self {
            code: Self::REMOTE_SYSTEM_ERROR,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: TaggedValue) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code == Self::SUCCESS
    }

    /// Decode the payload as `T`; `None` when there is none.
    pub fn data_as<T: 'static>(&self, types: &TypeRegistry) -> Result<Option<T>> {
        self.data
            .clone()
            .map(|tagged| types.unpack_as::<T>(tagged))
            .transpose()
    }
}

/// Every type the demo services carry in polymorphic fields.
pub fn comm_types() -> TypeAdvertisement {
    TypeAdvertisement::new()
        .with::<Args>("comm.Args")
        .with::<Args2>("comm.Args2")
        .with::<Flags>("comm.Flags")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_carries_registered_payload() {
        let types = TypeRegistry::new();
        types.register(&comm_types()).unwrap();

        let args = Args2 {
            string_value1: "v1".into(),
            string_value2: "v2".into(),
            flags1: Some(Flags {
                bool_value: true,
                string_value: "StringValue".into(),
                u32_value: 100,
                u16_value: 200,
            }),
        };
        let outcome = Outcome::success("initialized").with_data(types.pack(&args).unwrap());
        let wire = serde_json::to_string(&outcome).unwrap();
        let back: Outcome = serde_json::from_str(&wire).unwrap();

        assert!(back.is_ok());
        assert_eq!(back.data_as::<Args2>(&types).unwrap(), Some(args));
    }

    #[test]
    fn outcome_without_payload() {
        let outcome = Outcome::remote_error("lost runner");
        assert!(!outcome.is_ok());
        assert_eq!(outcome.data_as::<Args2>(&TypeRegistry::new()).unwrap(), None);
    }
}
