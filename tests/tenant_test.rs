//! Tenant resolution against the `config_empresas` table.

mod common;

use common::{MASTER_DB, manager, seeded_dir};
use tenant_db::{DbError, NamedParams, Value};

#[tokio::test]
async fn test_resolve_by_exact_key_and_pattern() {
    let dir = seeded_dir().await;
    let (manager, _) = manager(dir.path());

    assert_eq!(manager.resolve_tenant_database("Orquidea").await.unwrap(), "orquidea");
    assert_eq!(manager.resolve_tenant_database("rosas").await.unwrap(), "rosas");
    assert_eq!(manager.resolve_tenant_database("%Orquidea%").await.unwrap(), "orquidea");
    assert_eq!(manager.resolve_tenant_database("%del valle%").await.unwrap(), "rosas");

    manager.close_connection().await;
}

#[tokio::test]
async fn test_inactive_and_unknown_tenants() {
    let dir = seeded_dir().await;
    let (manager, _) = manager(dir.path());

    for key in ["OLD", "nobody", ""] {
        let err = manager.resolve_tenant_database(key).await.unwrap_err();
        assert!(matches!(err, DbError::TenantNotFound { .. }), "{key}: {err:?}");
        assert!(!err.is_retryable());
    }

    manager.close_connection().await;
}

#[tokio::test]
async fn test_ambiguous_pattern() {
    let dir = seeded_dir().await;
    let (manager, _) = manager(dir.path());

    // Matches "Orquidea" by key and "ROSAS" by key
    let err = manager.resolve_tenant_database("%o%").await.unwrap_err();
    match err {
        DbError::AmbiguousTenant { candidates, .. } => {
            assert_eq!(candidates, vec!["orquidea".to_string(), "rosas".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    manager.close_connection().await;
}

#[tokio::test]
async fn test_refresh_picks_up_new_tenants() {
    let dir = seeded_dir().await;
    let (manager, _) = manager(dir.path());

    assert_eq!(manager.active_tenants().await.unwrap().len(), 2);

    manager
        .execute_write(
            "UPDATE config_empresas SET activo = 1 WHERE codigo_empresa = @codigo",
            &NamedParams::new().with("codigo", "OLD"),
            Some(MASTER_DB),
        )
        .await
        .unwrap();

    // Cached until refreshed
    assert!(manager.resolve_tenant_database("OLD").await.is_err());
    assert_eq!(manager.refresh_tenants().await.unwrap(), 3);
    assert_eq!(manager.resolve_tenant_database("OLD").await.unwrap(), "legacy");

    manager.close_connection().await;
}

#[tokio::test]
async fn test_execute_for_tenant() {
    let dir = seeded_dir().await;
    let (manager, factory) = manager(dir.path());

    let rows = manager
        .execute_for_tenant(
            "%Orquidea Flowers%",
            "SELECT COUNT(*) AS count FROM ven_facturas WHERE cliente = @cliente",
            &NamedParams::new().with("cliente", "Rosas Export"),
        )
        .await
        .unwrap();
    assert_eq!(rows.scalar(), Some(&Value::Int(1)));

    // Master pool for the registry plus the tenant pool
    assert_eq!(factory.created(), 2);

    manager.close_connection().await;
}
