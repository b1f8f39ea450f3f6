use assetflow_engine::context::{ContextBuilder, PartitionWindow, TemplateContext};
use assetflow_engine::template::{render, TemplateError};
use assetflow_types::item::{FileMeta, ObjectMeta};
use assetflow_types::state::PartitionKey;
use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;

fn file_context() -> TemplateContext {
    ContextBuilder::new(Utc.with_ymd_and_hms(2024, 3, 2, 6, 0, 0).unwrap())
        .vars(json!({"team": "sales", "region": "eu-west"}))
        .partition(Some(PartitionWindow::key_only(PartitionKey::new("2024-03-01"))))
        .build()
        .with_item(
            &FileMeta::new("daily/orders.csv", "/outbound/daily/orders.csv", 64, 1_700_000_000)
                .into(),
        )
}

/// Literal text without delimiters, or a reference that resolves in
/// [`file_context`].
fn segment() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z0-9_/.-]{0,8}",
        Just("{{ vars.team }}".to_string()),
        Just("{{vars.region}}".to_string()),
        Just("{{ partition_key }}".to_string()),
        Just("{{ source.item.file_name }}".to_string()),
        Just("{{ source.item.full_file_path }}".to_string()),
        Just("{{ source.item.path }}".to_string()),
    ]
}

proptest! {
    #[test]
    fn non_whitelisted_fields_render_verbatim(raw in ".*", extra in "[a-z. ]{0,12}") {
        let ctx = file_context();
        let candidates = [
            raw.clone(),
            format!("{{{{ {extra} }}}}{raw}"),
            format!("{raw}{{{{ vars.missing }}}}"),
        ];
        for candidate in candidates {
            prop_assert_eq!(render(&candidate, &ctx, false, "source.host").unwrap(), candidate);
        }
    }

    #[test]
    fn whitelisted_rendering_is_idempotent(parts in prop::collection::vec(segment(), 0..6)) {
        let ctx = file_context();
        let raw = parts.concat();
        let once = render(&raw, &ctx, true, "target.key").unwrap();
        prop_assert!(!once.contains("{{"));
        let twice = render(&once, &ctx, true, "target.key").unwrap();
        prop_assert_eq!(twice, once);
    }

    #[test]
    fn file_attributes_never_resolve_on_objects(
        key in "[a-z]{1,6}/[a-z]{1,8}\\.json",
        attribute in prop::sample::select(
            vec!["file_name", "file_path", "full_file_path", "file_size"],
        ),
    ) {
        let ctx = ContextBuilder::new(Utc::now())
            .build()
            .with_item(&ObjectMeta::new("raw", key, None, 10, 0).into());
        let raw = format!("out/{{{{ source.item.{attribute} }}}}");
        let err = render(&raw, &ctx, true, "target.key").unwrap_err();
        let is_unresolved = matches!(err, TemplateError::Unresolved { .. });
        prop_assert!(is_unresolved, "expected unresolved, got {err}");
        prop_assert_eq!(err.field(), "target.key");
    }
}

#[test]
fn internal_file_path_is_not_exposed() {
    let err =
        render("{{ source.item.file_path }}", &file_context(), true, "target.key").unwrap_err();
    assert_eq!(
        err,
        TemplateError::Unresolved {
            field: "target.key".to_string(),
            token: "source.item.file_path".to_string(),
            reason: "attribute `file_path` is not defined for file items".to_string(),
        }
    );
}
