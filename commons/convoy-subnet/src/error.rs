#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CidrError {
    #[error("malformed CIDR: {0}")]
    Malformed(String),

    #[error("invalid IPv4 address: {0}")]
    InvalidAddress(String),

    #[error("invalid prefix length: {0}")]
    InvalidPrefix(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    #[error("a block with {0} usable hosts needs more than 31 host bits")]
    TooLarge(u64),

    #[error("no free /{prefix} block left after {cursor} in {base}")]
    Exhausted {
        base: String,
        cursor: String,
        prefix: u8,
    },
}
