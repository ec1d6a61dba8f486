//! CSV export/import through VaultService.

use std::collections::BTreeSet;

use kw_crypto::KdfParams;
use kw_vault::containers::NewContainer;
use kw_vault::items::NewItem;
use kw_vault::{
    ContainerType, Field, FieldType, ItemCategory, ItemFilter, VaultConfig, VaultError,
    VaultService,
};
use tempfile::{tempdir, TempDir};

const PASSWORD: &str = "correct-horse-battery-staple";

fn service(dir: &TempDir) -> VaultService {
    let mut cfg = VaultConfig::new(dir.path());
    cfg.kdf = KdfParams { memory_cost: 64, time_cost: 1, parallelism: 1 };
    cfg.kdf_policy.min_memory_kib = 8;
    VaultService::new(cfg).unwrap()
}

fn acme() -> NewContainer {
    NewContainer { container_type: ContainerType::Company, name: "Acme".into(), favorite: false }
}

fn field(key: &str, value: &str, encrypted: bool) -> Field {
    Field {
        key: key.into(),
        value: value.into(),
        encrypted,
        field_type: if encrypted { FieldType::Password } else { FieldType::Text },
    }
}

async fn seed(vault: &VaultService) {
    let acme = vault
        .create_container(acme())
        .await
        .unwrap();
    vault
        .create_item(NewItem {
            container_id: Some(acme.id.clone()),
            category: ItemCategory::Password,
            title: "GitHub".into(),
            domain: Some("github.com".into()),
            fields: vec![field("username", "alice", false), field("password", "s3\"cr,3t", true)],
            favorite: false,
        })
        .await
        .unwrap();
    vault
        .create_item(NewItem {
            container_id: None,
            category: ItemCategory::Payment,
            title: "Visa".into(),
            domain: None,
            fields: vec![field("card_number", "4111111111111111", true), field("cvv", "123", true)],
            favorite: true,
        })
        .await
        .unwrap();
    vault
        .create_item(NewItem {
            container_id: Some(acme.id),
            category: ItemCategory::Notice,
            title: "Office wifi".into(),
            domain: None,
            fields: vec![field("notes", "line one\nline two", false)],
            favorite: false,
        })
        .await
        .unwrap();
}

fn triples(items: &[kw_vault::VaultItem]) -> BTreeSet<(String, String, Option<String>)> {
    items
        .iter()
        .map(|i| (i.category.as_str().to_string(), i.title.clone(), i.domain.clone()))
        .collect()
}

#[tokio::test]
async fn test_export_header_and_quoting() {
    let dir = tempdir().unwrap();
    let vault = service(&dir);
    vault.create_vault(PASSWORD, "My Vault", None).await.unwrap();
    seed(&vault).await;

    let csv = vault.export_csv().await.unwrap();
    let header = csv.lines().next().unwrap();
    assert_eq!(
        header,
        "\"Type\",\"Container\",\"Title\",\"Domain\",\"Category\",\
         \"username\",\"password\",\"card_number\",\"cvv\",\"notes\""
    );
    // Decrypted, with the embedded quote doubled.
    assert!(csv.contains("\"s3\"\"cr,3t\""));
    assert!(csv.contains("\"company\",\"Acme\",\"GitHub\",\"github.com\",\"password\""));
}

#[tokio::test]
async fn test_export_import_round_trip() {
    let dir = tempdir().unwrap();
    let vault = service(&dir);
    vault.create_vault(PASSWORD, "Source", Some("source")).await.unwrap();
    seed(&vault).await;
    let original = vault.list_items(&ItemFilter::default()).await.unwrap();
    let csv = vault.export_csv().await.unwrap();
    vault.lock().await;

    vault.create_vault(PASSWORD, "Restored", Some("restored")).await.unwrap();
    let summary = vault.import_csv(&csv).await.unwrap();
    assert_eq!(summary.imported, 3);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.containers_created, 1);

    let restored = vault.list_items(&ItemFilter::default()).await.unwrap();
    assert_eq!(triples(&restored), triples(&original));

    let github = restored.iter().find(|i| i.title == "GitHub").unwrap();
    let password = github.field("password").unwrap();
    assert!(password.encrypted);
    assert_eq!(password.value, "s3\"cr,3t");
    assert!(!github.field("username").unwrap().encrypted);

    let visa = restored.iter().find(|i| i.title == "Visa").unwrap();
    assert!(visa.container_id.is_none());
    assert!(visa.field("cvv").unwrap().encrypted);
    assert_eq!(visa.field("card_number").unwrap().value, "4111111111111111");
    // Keys the item never had are not invented from empty cells.
    assert!(visa.field("username").is_none());

    let wifi = restored.iter().find(|i| i.title == "Office wifi").unwrap();
    assert_eq!(wifi.field("notes").unwrap().value, "line one\nline two");
    assert_eq!(wifi.container_id, github.container_id);
}

#[tokio::test]
async fn test_import_reuses_containers_by_name() {
    let dir = tempdir().unwrap();
    let vault = service(&dir);
    vault.create_vault(PASSWORD, "My Vault", None).await.unwrap();
    let existing = vault
        .create_container(acme())
        .await
        .unwrap();

    let csv = "Type,Container,Title,Domain,Category,username,password\n\
               company,Acme,VPN,vpn.acme.test,password,bob,hunter2\n\
               identity,Acme,Passport,,notice,,\n\
               ,,,nowhere.test,password,x,y\n\
               company,Acme,Wiki,wiki.acme.test,bogus,,\n";
    let summary = vault.import_csv(csv).await.unwrap();
    assert_eq!(summary.imported, 2);
    assert_eq!(summary.skipped, 2);
    // "Acme" as an identity is a different container.
    assert_eq!(summary.containers_created, 1);

    let vpn = vault.search("vpn").await.unwrap();
    assert_eq!(vpn.len(), 1);
    assert_eq!(vpn[0].container_id.as_deref(), Some(existing.id.as_str()));
    assert_eq!(vpn[0].field("password").unwrap().value, "hunter2");
    assert_eq!(vault.list_containers(None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_import_rejects_bad_input_atomically() {
    let dir = tempdir().unwrap();
    let vault = service(&dir);
    vault.create_vault(PASSWORD, "My Vault", None).await.unwrap();

    let err = vault.import_csv("Name,Url\nx,y\n").await.unwrap_err();
    assert!(matches!(err, VaultError::InvalidInput(_)), "got {err:?}");

    let err = vault
        .import_csv("Type,Container,Title,Domain,Category\n,,\"Broken,,password\n")
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::InvalidInput(_)), "got {err:?}");

    assert!(matches!(vault.import_csv("").await, Err(VaultError::InvalidInput(_))));
    assert!(vault.list_items(&ItemFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_field_keys_are_unique_per_item() {
    let dir = tempdir().unwrap();
    let vault = service(&dir);
    vault.create_vault(PASSWORD, "My Vault", None).await.unwrap();

    let err = vault
        .create_item(NewItem {
            container_id: None,
            category: ItemCategory::Password,
            title: "Twice".into(),
            domain: None,
            fields: vec![field("password", "first", true), field("password", "second", true)],
            favorite: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::InvalidInput(_)), "got {err:?}");

    let err = vault
        .import_csv("Type,Container,Title,Domain,Category,password,password
,,X,,password,a,b
")
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::InvalidInput(msg) if msg.contains("password")));
    assert!(vault.list_items(&ItemFilter::default()).await.unwrap().is_empty());
}
