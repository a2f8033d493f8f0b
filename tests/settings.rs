//! Process-wide settings. Kept in one test so nothing else observes the
//! global while it is replaced.

use pgatomic::config::{self, Settings};
use pgatomic::memory::MemoryDatabase;
use pgatomic::{
    atomic, Connections, DatabaseError, Error, SqlState, DEFAULT_DB_ALIAS, REPEATABLE_READ,
};

fn serialization_failure() -> Error {
    DatabaseError::serialization_failure("concurrent update").into()
}

#[test]
fn test_global_settings_drive_default_retries() {
    let db = MemoryDatabase::new();
    let mut conns = Connections::with_default(db.connect());

    let previous = config::configure(Settings::new().retry(2));

    // Default budget applies to outermost callables
    let mut attempts = 0;
    let result = atomic().isolation_level(REPEATABLE_READ).run(&mut conns, |_| {
        attempts += 1;
        Err::<(), _>(serialization_failure())
    });
    assert!(result.is_err());
    assert_eq!(attempts, 3);

    // An explicit value wins
    let mut attempts = 0;
    let _ = atomic().retry(0).run(&mut conns, |_| {
        attempts += 1;
        Err::<(), _>(serialization_failure())
    });
    assert_eq!(attempts, 1);

    // The default budget reaches scoped blocks, which can't retry
    let err = atomic().enter(&mut conns).unwrap_err();
    assert!(err.is_configuration());
    assert!(!conns.in_atomic_block(DEFAULT_DB_ALIAS).unwrap());
    let block = atomic().retry(0).enter(&mut conns).unwrap();
    block.commit().unwrap();

    // Nested callables inherit it too and are refused before running
    let mut outer_attempts = 0;
    let mut inner_attempts = 0;
    let result = atomic().run(&mut conns, |conns| {
        outer_attempts += 1;
        atomic().run(conns, |_| {
            inner_attempts += 1;
            Ok::<(), Error>(())
        })
    });
    assert!(matches!(result, Err(Error::Configuration(_))));
    assert_eq!(outer_attempts, 1);
    assert_eq!(inner_attempts, 0);

    // With an explicit zero, the nested call runs once per outer attempt
    let mut outer_attempts = 0;
    let mut inner_attempts = 0;
    let result = atomic().run(&mut conns, |conns| {
        outer_attempts += 1;
        atomic().retry(0).run(conns, |_| {
            inner_attempts += 1;
            Err::<(), _>(serialization_failure())
        })
    });
    assert!(result.is_err());
    assert_eq!(outer_attempts, 3);
    assert_eq!(inner_attempts, 3);

    // Only configured errors are retried
    config::configure(
        Settings::new()
            .retry(2)
            .retry_exceptions([SqlState::DEADLOCK_DETECTED]),
    );
    let mut attempts = 0;
    let _ = atomic().run(&mut conns, |_| {
        attempts += 1;
        Err::<(), _>(serialization_failure())
    });
    assert_eq!(attempts, 1);

    let mut attempts = 0;
    let _ = atomic().run(&mut conns, |_| {
        attempts += 1;
        Err::<(), Error>(DatabaseError::deadlock_detected().into())
    });
    assert_eq!(attempts, 3);

    config::configure(previous.clone());
    assert_eq!(config::settings(), previous);
}
