/// Joins the messages of `err` and all of its sources, so that the cause of a snafu error
/// is not lost when it is turned into a flat message.
pub fn snafu_error_to_string<E: std::error::Error>(err: &E) -> String {
    let mut result = format!("{err}");
    let mut source = err.source();
    while let Some(err) = source {
        result.push_str(format!(": {err}").as_str());
        source = err.source();
    }

    result
}

#[test]
fn test_error_formatting() {
    use extrica_adapter_core::{config, credentials};

    let err = config::Error::ResolveCredentials {
        source: credentials::Error::InvalidField {
            field: "port".to_owned(),
            reason: "must not be 0".to_owned(),
        },
        profile: "dbt_extrica".to_owned(),
        target: "dev".to_owned(),
    };

    assert_eq!(
        format!("{err}"),
        "Invalid credentials for target \"dev\" of profile \"dbt_extrica\""
    );
    assert_eq!(
        snafu_error_to_string(&err),
        "Invalid credentials for target \"dev\" of profile \"dbt_extrica\": The credential field \"port\" is invalid: must not be 0"
    );
}
