pub mod explain;
pub mod query;
pub mod schema;

use crate::app::AppContext;
use crate::cli::query::QueryArgs;
use crate::error::CliError;
use quarry_rs_sdk::{Accountability, QueryRequest};

pub(crate) fn request_from_args(args: &QueryArgs) -> Result<QueryRequest, CliError> {
    let filter = args
        .filter
        .as_deref()
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .map_err(|err| CliError::msg(format!("--filter is not valid JSON: {err}")))?;
    Ok(QueryRequest {
        fields: args.fields.clone(),
        filter,
        sort: args.sort.clone(),
        limit: args.limit,
        offset: args.offset,
        ..QueryRequest::new(args.collection.clone())
    })
}

/// Without a policy document there is nothing to evaluate against, so requests run as admin.
pub(crate) fn accountability_from_args(
    context: &AppContext,
    args: &QueryArgs,
) -> Result<Accountability, CliError> {
    let has_identity = args.user.is_some() || !args.roles.is_empty() || args.ip.is_some();
    if context.policies_path.is_none() {
        if has_identity {
            return Err(CliError::InvalidArgs(
                "--user, --role and --ip need --policies",
            ));
        }
        return Ok(Accountability::admin());
    }

    let mut accountability = match &args.user {
        Some(user) => Accountability::user(user.clone(), args.roles.clone()),
        None => Accountability {
            roles: args.roles.clone(),
            ..Accountability::public()
        },
    };
    if let Some(ip) = args.ip {
        accountability = accountability.with_ip(ip);
    }
    Ok(accountability)
}
