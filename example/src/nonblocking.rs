use futures::{StreamExt, TryStreamExt};
use porta::{AsyncConnection, Result};

pub async fn main() -> Result<()> {
    let conn = AsyncConnection::connect_env().await?;

    // Stream rows

    let mut cursor = conn.cursor_auto();
    cursor.set_itersize(100);
    cursor.execute("SELECT generate_series(1, $1)", &[&1000]).await?;

    let sum = cursor
        .rows()
        .map_ok(|row| row.try_get::<_, i64>(0).unwrap_or_default())
        .try_fold(0, |acc, n| async move { Ok(acc + n) })
        .await?;
    assert_eq!(sum, 500500);
    cursor.close().await?;

    // Share the session with blocking threads

    let blocking = conn.to_blocking();
    let task = tokio::task::spawn_blocking(move || {
        blocking.execute("SELECT pg_sleep(0.01)", &[]).map(|_| ())
    });

    let mut other = conn.cursor("porta_async");
    other.execute("SELECT generate_series(0, 9)", &[]).await?;
    other.scroll(3, "relative").await?;
    let row = other.fetchone().await?.expect("fourth row");
    assert_eq!(row.try_get::<_, i32>(0)?, 3);

    task.await.map_err(std::io::Error::other)??;

    let rest: Vec<_> = other.rows().collect().await;
    assert_eq!(rest.len(), 6);
    other.close().await?;

    conn.rollback().await?;
    conn.close().await;
    Ok(())
}
