use porta::{Connection, DeclareOptions, Result, ScrollMode};

pub fn main() -> Result<()> {
    let conn = Connection::connect_env()?;

    conn.execute("CREATE TEMP TABLE porta(id serial, name text)", &[])?;
    conn.execute("INSERT INTO porta(name) SELECT 'user ' || n FROM generate_series(1, 50) n", &[])?;
    conn.commit()?;

    // Iterate in batches

    let mut cursor = conn.cursor_auto();
    cursor.set_itersize(8);
    cursor.execute("SELECT id, name FROM porta WHERE id > $1 ORDER BY id", &[&10])?;

    let mut seen = 0;
    for row in cursor.iter() {
        let (id, name) = row?.decode::<(i32, String)>()?;
        assert_eq!(name, format!("user {id}"));
        seen += 1;
    }
    assert_eq!(seen, 40);

    // Scroll

    cursor.scroll(0, ScrollMode::Absolute)?;
    let first = cursor.fetchone()?.expect("first row");
    assert_eq!(first.try_get::<_, i32>("id")?, 11);
    assert_eq!(cursor.rownumber(), Some(1));

    cursor.scroll(-2, "absolute")?;
    let last = cursor.fetchall()?;
    assert_eq!(last.len(), 1);

    cursor.close()?;
    conn.commit()?;

    // A held cursor survives commit

    let mut held = conn.cursor("porta_held");
    held.execute_with("SELECT id FROM porta", &[], DeclareOptions::default().hold(true))?;
    conn.commit()?;

    let batch = held.fetchmany(5)?;
    assert_eq!(batch.len(), 5);
    held.close()?;

    // Error case

    let mut broken = conn.cursor_auto();
    broken.execute("SELECT foo", &[]).unwrap_err();
    conn.rollback()?;

    broken.execute("SELECT 1", &[])?;
    assert_eq!(broken.fetchall()?.len(), 1);
    broken.close()?;
    conn.rollback()?;

    conn.close();
    Ok(())
}
