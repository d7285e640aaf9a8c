pub mod policy;

pub use policy::{
    DenyReason, OriginConfigError, OriginDecision, OriginPolicy, OriginRule,
    DEFAULT_PRIMARY_DOMAIN,
};
