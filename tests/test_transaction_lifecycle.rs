use quarrydb::catalog::Manager;
use quarrydb::{row, Cell, Column, ColumnType, Config, Error, ErrorKind, Statement};
use tempfile::TempDir;

fn open(dir: &TempDir) -> Manager {
    let config = Config::builder()
        .root_dir(dir.path())
        .sync_log(false)
        .build();
    Manager::open(config).unwrap()
}

fn create_t() -> Statement {
    Statement::CreateTable {
        table: "t".to_string(),
        columns: vec![
            Column::new("id", ColumnType::Int).primary_key(true),
            Column::string("name", 10),
        ],
    }
}

fn select_t() -> Statement {
    Statement::Select {
        table: "t".to_string(),
        key: None,
    }
}

#[test]
fn test_transaction_lifecycle() {
    let dir = TempDir::new().unwrap();
    let manager = open(&dir);
    let session = manager.connect();

    // BEGIN
    let result = manager.execute(session, Statement::Begin).unwrap();
    assert!(result.message.unwrap().contains("started"));
    assert!(manager.in_transaction(session));

    // BEGIN again is refused
    let err = manager.execute(session, Statement::Begin).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transaction);

    // COMMIT
    let result = manager.execute(session, Statement::Commit).unwrap();
    assert!(result.message.unwrap().contains("committed"));
    assert!(!manager.in_transaction(session));

    // COMMIT without BEGIN is refused
    assert!(matches!(
        manager.execute(session, Statement::Commit),
        Err(Error::NotInTransaction(_))
    ));
}

#[test]
fn test_end_to_end_example() {
    let dir = TempDir::new().unwrap();
    {
        let manager = open(&dir);
        let session = manager.connect();
        manager.execute(session, create_t()).unwrap();
        manager
            .execute(
                session,
                Statement::Insert {
                    table: "t".to_string(),
                    rows: vec![row![1, "a"], row![2, "b"]],
                },
            )
            .unwrap();
        manager
            .execute(
                session,
                Statement::Delete {
                    table: "t".to_string(),
                    keys: vec![Cell::Int(1)],
                },
            )
            .unwrap();
        manager.disconnect(session).unwrap();
        manager.quit().unwrap();
    }

    let manager = open(&dir);
    let session = manager.connect();
    let result = manager.execute(session, select_t()).unwrap();
    assert_eq!(result.rows, vec![row![2, "b"]]);
}

#[test]
fn test_explicit_transaction_spans_statements() {
    let dir = TempDir::new().unwrap();
    let manager = open(&dir);
    let session = manager.connect();
    manager.execute(session, create_t()).unwrap();

    manager.execute(session, Statement::Begin).unwrap();
    manager
        .execute(
            session,
            Statement::Insert {
                table: "t".to_string(),
                rows: vec![row![1, "a"]],
            },
        )
        .unwrap();
    manager
        .execute(
            session,
            Statement::Update {
                table: "t".to_string(),
                old_keys: vec![Cell::Int(1)],
                new_rows: vec![row![10, "a"]],
            },
        )
        .unwrap();
    assert!(manager.in_transaction(session));
    manager.execute(session, Statement::Commit).unwrap();

    let result = manager.execute(session, select_t()).unwrap();
    assert_eq!(result.rows, vec![row![10, "a"]]);
}

#[test]
fn test_disconnect_commits_open_transaction() {
    let dir = TempDir::new().unwrap();
    let manager = open(&dir);
    let session = manager.connect();
    manager.execute(session, create_t()).unwrap();

    manager.execute(session, Statement::Begin).unwrap();
    manager
        .execute(
            session,
            Statement::Insert {
                table: "t".to_string(),
                rows: vec![row![1, "a"]],
            },
        )
        .unwrap();
    manager.disconnect(session).unwrap();
    assert!(manager.is_quiet());

    let log = std::fs::read_to_string(dir.path().join("data/db/log")).unwrap();
    assert!(log.ends_with("commit\n"));
}

#[test]
fn test_statement_errors_are_typed() {
    let dir = TempDir::new().unwrap();
    let manager = open(&dir);
    let session = manager.connect();
    manager.execute(session, create_t()).unwrap();

    let err = manager.execute(session, create_t()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Schema);

    let err = manager
        .execute(
            session,
            Statement::Insert {
                table: "t".to_string(),
                rows: vec![row![1, "far too long a name"]],
            },
        )
        .unwrap_err();
    assert!(matches!(err, Error::ValueTooLarge { .. }));

    let err = manager
        .execute(
            session,
            Statement::Delete {
                table: "t".to_string(),
                keys: vec![Cell::Int(42)],
            },
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Key);

    let err = manager.execute(
        session,
        Statement::Select {
            table: "missing".to_string(),
            key: None,
        },
    );
    assert!(matches!(err, Err(Error::TableNotFound(_))));
    assert!(manager.is_quiet());
}
