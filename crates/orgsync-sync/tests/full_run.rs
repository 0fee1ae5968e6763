use chrono::NaiveDate;
use orgsync_core::{
    EntityFamily, SourceEmployee, SourceOrder, SourceOrderItem, SourceOrganization, SyncError,
};
use orgsync_source::MemorySource;
use orgsync_storage::MemoryDestination;
use orgsync_sync::{RowFailurePolicy, SyncOptions, SyncOrchestrator};

fn acme() -> SourceOrganization {
    SourceOrganization {
        source_id: 1,
        registration_number: "123".into(),
        name: Some("Acme".into()),
        email: Some("contato@acme.com".into()),
    }
}

fn ana() -> SourceEmployee {
    SourceEmployee {
        source_id: 1,
        first_name: "Ana".into(),
        last_name: "Silva".into(),
        role_name: Some("Gerente".into()),
        status: Some("ativo".into()),
        email: Some("a@acme.com".into()),
        organization_registration: "123".into(),
    }
}

fn invoice(source_id: i64, code: &str, cnpj: &str) -> SourceOrder {
    SourceOrder {
        source_id,
        invoice_code: code.into(),
        issued_on: NaiveDate::from_ymd_opt(2024, 1, 1),
        organization_registration: cnpj.into(),
    }
}

fn widget(quantity: f64) -> SourceOrderItem {
    SourceOrderItem {
        product_name: "Widget".into(),
        quantity: Some(quantity),
        unit_symbol: Some("UN".into()),
        ean: "789".into(),
    }
}

fn globex() -> SourceOrganization {
    SourceOrganization {
        source_id: 2,
        registration_number: "456".into(),
        name: Some("Globex".into()),
        email: None,
    }
}

fn scenario() -> MemorySource {
    MemorySource::new()
        .with_organization(acme())
        .with_employee(ana())
        .with_order(invoice(1, "NF1", "123"), vec![widget(5.0)])
}

async fn run(source: &MemorySource, dest: &mut MemoryDestination, options: SyncOptions) -> Result<orgsync_sync::SyncRunSummary, SyncError> {
    SyncOrchestrator::new(source, dest, options).run().await
}

#[tokio::test]
async fn single_run_materializes_every_entity_once() {
    let source = scenario();
    let mut dest = MemoryDestination::new();

    let summary = run(&source, &mut dest, SyncOptions::default()).await.expect("sync");

    let state = dest.committed();
    assert_eq!(state.row_counts(), [1, 1, 1, 1, 1, 1, 1]);

    let org = state.organization("123").expect("organization");
    assert_eq!(org.name, "Acme");
    assert_eq!(state.roles[0].name, "Gerente");
    assert_eq!(state.roles[0].organization_id, org.id);

    let employee = state.employee("Ana", "Silva").expect("employee");
    assert_eq!(employee.status.as_deref(), Some("ATIVO"));
    assert_eq!(employee.role_id, state.roles[0].id);
    assert_eq!(employee.organization_id, org.id);

    assert_eq!(state.units[0].symbol, "UN");
    assert_eq!(state.products[0].name, "Widget");
    assert_eq!(state.products[0].organization_id, org.id);
    assert_eq!(state.orders[0].invoice_code, "NF1");
    assert_eq!(state.orders[0].issued_on, NaiveDate::from_ymd_opt(2024, 1, 1));
    assert_eq!(state.order_items[0].quantity, 5.0);
    assert_eq!(state.order_items[0].order_id, state.orders[0].id);
    assert_eq!(state.order_items[0].product_id, state.products[0].id);

    let orders = summary.phase(EntityFamily::Orders).expect("orders phase");
    assert_eq!(orders.rows_written, 1);
    assert_eq!(orders.items_written, 1);
}

#[tokio::test]
async fn rerunning_the_same_snapshot_is_idempotent() {
    let source = scenario();
    let mut dest = MemoryDestination::new();

    run(&source, &mut dest, SyncOptions::default()).await.expect("first run");
    let after_first = dest.committed().clone();
    run(&source, &mut dest, SyncOptions::default()).await.expect("second run");

    assert_eq!(dest.committed(), &after_first);
}

#[tokio::test]
async fn renamed_organization_is_updated_in_place() {
    let mut source = scenario();
    let mut dest = MemoryDestination::new();
    run(&source, &mut dest, SyncOptions::default()).await.expect("first run");
    let original_id = dest.committed().organization("123").expect("org").id;

    source.organizations[0].name = Some("Acme Industria".into());
    run(&source, &mut dest, SyncOptions::default()).await.expect("second run");

    let state = dest.committed();
    assert_eq!(state.organizations.len(), 1);
    let org = state.organization("123").expect("org");
    assert_eq!(org.id, original_id);
    assert_eq!(org.name, "Acme Industria");
}

#[tokio::test]
async fn every_status_casing_is_stored_uppercase() {
    let mut source = MemorySource::new().with_organization(acme());
    for (i, status) in ["ativo", "ATIVO", "Ativo"].into_iter().enumerate() {
        source = source.with_employee(SourceEmployee {
            first_name: format!("Ana{i}"),
            status: Some(status.into()),
            ..ana()
        });
    }
    let mut dest = MemoryDestination::new();
    run(&source, &mut dest, SyncOptions::default()).await.expect("sync");

    let statuses: Vec<_> = dest
        .committed()
        .employees
        .iter()
        .map(|e| e.status.clone())
        .collect();
    assert_eq!(statuses, vec![Some("ATIVO".to_string()); 3]);
}

#[tokio::test]
async fn one_role_row_per_name_and_organization() {
    let mut source = MemorySource::new().with_organization(acme()).with_organization(globex());
    for (i, cnpj) in ["123", "123", "123", "456"].into_iter().enumerate() {
        source = source.with_employee(SourceEmployee {
            first_name: format!("Func{i}"),
            organization_registration: cnpj.into(),
            ..ana()
        });
    }
    let mut dest = MemoryDestination::new();
    run(&source, &mut dest, SyncOptions::default()).await.expect("sync");

    let state = dest.committed();
    assert_eq!(state.roles.len(), 2);
    let acme_id = state.organization("123").expect("acme").id;
    let acme_role = state
        .roles
        .iter()
        .find(|r| r.organization_id == acme_id)
        .expect("acme role");
    let referencing = state
        .employees
        .iter()
        .filter(|e| e.role_id == acme_role.id)
        .count();
    assert_eq!(referencing, 3);
}

#[tokio::test]
async fn line_items_are_read_per_order_and_reuse_products() {
    let source = MemorySource::new()
        .with_organization(acme())
        .with_order(invoice(1, "NF1", "123"), vec![widget(5.0)])
        .with_order(invoice(2, "NF2", "123"), vec![widget(2.0)]);
    let mut dest = MemoryDestination::new();

    run(&source, &mut dest, SyncOptions::default()).await.expect("sync");

    assert_eq!(source.item_reads(), 2);
    let state = dest.committed();
    assert_eq!(state.products.len(), 1);
    assert_eq!(state.units.len(), 1);
    let quantities: Vec<_> = state.order_items.iter().map(|i| i.quantity).collect();
    assert_eq!(quantities, vec![5.0, 2.0]);
}

#[tokio::test]
async fn changed_item_quantity_updates_the_existing_line() {
    let mut source = scenario();
    let mut dest = MemoryDestination::new();
    run(&source, &mut dest, SyncOptions::default()).await.expect("first run");

    source.order_items.insert(1, vec![widget(8.0)]);
    run(&source, &mut dest, SyncOptions::default()).await.expect("second run");

    let state = dest.committed();
    assert_eq!(state.order_items.len(), 1);
    assert_eq!(state.order_items[0].quantity, 8.0);
}

#[tokio::test]
async fn failure_keeps_earlier_phases_committed() {
    let source = MemorySource::new()
        .with_organization(acme())
        .with_employee(ana())
        .with_employee(SourceEmployee {
            first_name: "Bruno".into(),
            organization_registration: "999".into(),
            ..ana()
        });
    let mut dest = MemoryDestination::new();

    let err = run(&source, &mut dest, SyncOptions::default()).await.unwrap_err();

    assert_eq!(
        err,
        SyncError::UnresolvedReference {
            entity: "organization",
            key: "999".into()
        }
    );
    assert_eq!(dest.commits(), 1);
    assert_eq!(dest.committed().organizations.len(), 1);
    assert!(dest.committed().employees.is_empty());
    assert_eq!(dest.pending().employees.len(), 1, "rows before the failure stay applied");
}

#[tokio::test]
async fn source_read_failures_end_the_run_even_when_skipping() {
    let source = scenario().fail_reading(EntityFamily::Employees);
    let mut dest = MemoryDestination::new();
    let options = SyncOptions {
        row_failure_policy: RowFailurePolicy::Skip,
        dry_run: false,
    };

    let err = run(&source, &mut dest, options).await.unwrap_err();
    assert!(matches!(err, SyncError::DataAccess { .. }));
    assert_eq!(dest.commits(), 1);
}

#[tokio::test]
async fn skip_policy_reports_bad_rows_and_keeps_going() {
    let source = MemorySource::new()
        .with_organization(acme())
        .with_employee(SourceEmployee {
            first_name: "Bruno".into(),
            organization_registration: "999".into(),
            ..ana()
        })
        .with_employee(ana())
        .with_order(invoice(1, "NF1", "123"), vec![widget(5.0), widget(-1.0)])
        .with_order(invoice(2, "NF2", "123"), vec![widget(3.0)]);
    let mut dest = MemoryDestination::new();
    let options = SyncOptions {
        row_failure_policy: RowFailurePolicy::Skip,
        dry_run: false,
    };

    let summary = run(&source, &mut dest, options).await.expect("sync");

    let state = dest.committed();
    assert_eq!(state.employees.len(), 1);
    assert!(state.employee("Ana", "Silva").is_some());
    let codes: Vec<_> = state.orders.iter().map(|o| o.invoice_code.as_str()).collect();
    assert_eq!(codes, vec!["NF2"], "the failing order is rolled back with its items");
    assert_eq!(state.order_items.len(), 1);
    assert_eq!(state.order_items[0].quantity, 3.0);

    assert_eq!(summary.failures.len(), 2);
    assert_eq!(summary.failures[0].family, EntityFamily::Employees);
    assert_eq!(summary.failures[0].key, "Bruno Silva");
    assert_eq!(summary.failures[1].family, EntityFamily::Orders);
    assert_eq!(summary.failures[1].key, "NF1");
    assert_eq!(summary.phase(EntityFamily::Orders).expect("orders").rows_failed, 1);
}

#[tokio::test]
async fn dry_run_leaves_the_destination_untouched() {
    let source = scenario();
    let mut dest = MemoryDestination::new();
    let options = SyncOptions {
        row_failure_policy: RowFailurePolicy::Abort,
        dry_run: true,
    };

    let summary = run(&source, &mut dest, options).await.expect("sync");

    assert!(summary.dry_run);
    assert_eq!(summary.rows_written(), 3);
    assert_eq!(dest.commits(), 0);
    assert_eq!(dest.committed().row_counts(), [0; 7]);
    assert_eq!(dest.pending().row_counts(), [0; 7]);
}

#[tokio::test]
async fn natural_keys_keep_their_scope_across_organizations() {
    let source = MemorySource::new()
        .with_organization(acme())
        .with_organization(globex())
        .with_employee(ana())
        .with_employee(SourceEmployee {
            source_id: 2,
            email: Some("a@globex.com".into()),
            organization_registration: "456".into(),
            ..ana()
        })
        .with_order(invoice(1, "NF1", "123"), vec![widget(5.0)])
        .with_order(invoice(2, "NF2", "456"), vec![widget(2.0)]);
    let mut dest = MemoryDestination::new();

    run(&source, &mut dest, SyncOptions::default()).await.expect("sync");

    let state = dest.committed();
    assert_eq!(state.row_counts(), [2, 2, 1, 1, 2, 2, 2]);
    let acme_id = state.organization("123").expect("acme").id;
    let globex_id = state.organization("456").expect("globex").id;

    // Employees are keyed by name alone: the later organization wins.
    let employee = state.employee("Ana", "Silva").expect("employee");
    assert_eq!(employee.organization_id, globex_id);
    assert_eq!(employee.email.as_deref(), Some("a@globex.com"));
    let globex_role = state
        .roles
        .iter()
        .find(|r| r.organization_id == globex_id)
        .expect("globex role");
    assert_eq!(employee.role_id, globex_role.id);

    // Products are keyed by (ean, organization).
    let mut product_orgs: Vec<_> = state
        .products
        .iter()
        .filter(|p| p.ean == "789")
        .map(|p| p.organization_id)
        .collect();
    product_orgs.sort_unstable();
    let mut expected = vec![acme_id, globex_id];
    expected.sort_unstable();
    assert_eq!(product_orgs, expected);

    // Units are global.
    assert_eq!(state.units.len(), 1);
    assert!(state.products.iter().all(|p| p.unit_id == state.units[0].id));
}

#[tokio::test]
async fn missing_source_values_are_skippable_row_failures() {
    let source = MemorySource::new()
        .with_organization(SourceOrganization {
            source_id: 3,
            registration_number: "789".into(),
            name: None,
            email: None,
        })
        .with_organization(acme())
        .with_order(
            invoice(1, "NF1", "123"),
            vec![SourceOrderItem {
                quantity: None,
                ..widget(0.0)
            }],
        )
        .with_order(invoice(2, "NF2", "123"), vec![widget(3.0)]);
    let mut dest = MemoryDestination::new();
    let options = SyncOptions {
        row_failure_policy: RowFailurePolicy::Skip,
        dry_run: false,
    };

    let summary = run(&source, &mut dest, options).await.expect("sync");

    let state = dest.committed();
    assert_eq!(state.organizations.len(), 1);
    assert!(state.organization("789").is_none());
    assert_eq!(state.orders.len(), 1);
    assert_eq!(state.orders[0].invoice_code, "NF2");

    let keys: Vec<_> = summary.failures.iter().map(|f| f.key.as_str()).collect();
    assert_eq!(keys, vec!["789", "NF1"]);
    assert!(summary
        .failures
        .iter()
        .all(|f| matches!(f.error, SyncError::InvalidRecord { .. })));
}
