pub mod credential_format;
pub mod dcql_query;
pub mod util;
