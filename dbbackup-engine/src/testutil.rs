//! Fake client tools for tests: small shell scripts standing in for psql,
//! pg_dump, pg_dumpall, pg_restore and pigz. They keep their state (the
//! database list, sizes, failure switches, logs) as files in a temp dir.

use crate::adapter::DatabaseAdapter;
use crate::config::{Config, ToolPaths};
use crate::diskspace::{DiskCapacity, DiskProbe};
use crate::executor::PipelineExecutor;
use crate::state::EngineState;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> io::Result<PathBuf> {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path)?;
    file.write_all(b"#!/bin/sh\n")?;
    file.write_all(body.as_bytes())?;
    file.sync_all()?;
    drop(file);
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

const PSQL: &str = r#"
db=""; sql=""
while [ $# -gt 0 ]; do
  case "$1" in
    -d) db="$2"; shift ;;
    -c) sql="$2"; shift ;;
  esac
  shift
done
if [ -z "$sql" ]; then
  if [ -f "$STATE/fail_restore_$db" ]; then
    cat > /dev/null
    echo "psql:<stdin>:1: ERROR:  forced failure for $db" >&2
    exit 3
  fi
  cat >> "$STATE/restored_$db.sql"
  echo "$db" >> "$STATE/restore.log"
  exit 0
fi
printf '%s\n' "$sql" >> "$STATE/sql.log"
case "$sql" in
  *"TO STDOUT"*) printf '1\tfirst\n2\tsecond\n' ;;
  *"FROM pg_database "*) cat "$STATE/databases" ;;
  *pg_database_size*)
    size=1024
    for name in $(cat "$STATE/databases"); do
      case "$sql" in *"'$name'"*) [ -f "$STATE/size_$name" ] && size=$(cat "$STATE/size_$name") ;; esac
    done
    echo "$size" ;;
  *usesuper*) cat "$STATE/superuser" ;;
  *server_version*) echo "16.2" ;;
  *pg_tables*) echo "public.items" ;;
esac
exit 0
"#;

const PG_DUMP: &str = r#"
out=""; db=""; fmt="c"; schema=0
while [ $# -gt 0 ]; do
  case "$1" in
    -f) out="$2"; shift ;;
    -Fp) fmt="p" ;;
    -Fc) fmt="c" ;;
    --schema-only) schema=1 ;;
    -h|-p|-U|-t) shift ;;
    -*) ;;
    *) db="$1" ;;
  esac
  shift
done
echo "$db" >> "$STATE/dump.log"
if [ -f "$STATE/fail_dump_$db" ]; then
  echo "pg_dump: error: connection to database \"$db\" failed: FATAL:  forced failure" >&2
  exit 1
fi
if [ "$schema" = 1 ]; then
  body="CREATE TABLE public.items (id integer, name text);"
elif [ "$fmt" = c ]; then
  body="PGDMP custom dump of $db"
  [ -f "$STATE/lo_$db" ] && body="$body with BLOB data"
else
  body="-- plain dump of $db"
fi
if [ -n "$out" ]; then printf '%s\n' "$body" > "$out"; else printf '%s\n' "$body"; fi
"#;

const PG_DUMPALL: &str = r#"
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -f) out="$2"; shift ;;
  esac
  shift
done
if [ -f "$STATE/fail_globals" ]; then
  echo "pg_dumpall: error: FATAL:  forced failure" >&2
  exit 1
fi
printf 'CREATE ROLE app;\n' > "$out"
"#;

const PG_RESTORE: &str = r#"
list=0; db=""; file=""
while [ $# -gt 0 ]; do
  case "$1" in
    -l) list=1 ;;
    -d) db="$2"; shift ;;
    -h|-p|-U|-j) shift ;;
    -*) ;;
    *) file="$1" ;;
  esac
  shift
done
if [ "$list" = 1 ]; then
  echo ";"
  echo "; Archive created at 2024-01-01 00:00:00"
  echo "215; 1259 16385 TABLE public items app"
  if grep -q BLOB "$file"; then echo "3338; 2613 16398 BLOB - 16398 app"; fi
  exit 0
fi
if [ -f "$STATE/fail_restore_$db" ]; then
  echo "pg_restore: error: could not execute query: ERROR:  forced failure for $db" >&2
  exit 1
fi
echo "start $db" >> "$STATE/restore.log"
[ -f "$STATE/slow" ] && sleep 0.2
cp "$file" "$STATE/restored_$db.dump"
echo "end $db" >> "$STATE/restore.log"
"#;

/// A filesystem that is never close to full
pub(crate) struct RoomyDisk;

impl DiskProbe for RoomyDisk {
    fn capacity(&self, _path: &Path) -> crate::utils::errors::Result<DiskCapacity> {
        Ok(DiskCapacity {
            total: 100 << 30,
            available: 90 << 30,
        })
    }
}

const PIGZ: &str = "exec gzip -c\n";

/// A fake PostgreSQL server: scripted client tools plus their state.
pub(crate) struct FakeServer {
    dir: TempDir,
    pub tools: ToolPaths,
}

impl FakeServer {
    pub fn new(databases: &[&str]) -> io::Result<Self> {
        let dir = TempDir::new()?;
        let bin = dir.path().join("bin");
        let state = dir.path().join("state");
        std::fs::create_dir_all(&bin)?;
        std::fs::create_dir_all(&state)?;
        std::fs::write(state.join("databases"), databases.iter().map(|d| format!("{}\n", d)).collect::<String>())?;
        std::fs::write(state.join("superuser"), "t\n")?;

        let header = format!("STATE='{}'\n", state.display());
        let script = |name: &str, body: &str| write_script(&bin, name, &format!("{}{}", header, body));
        let tools = ToolPaths {
            psql: script("psql", PSQL)?,
            pg_dump: script("pg_dump", PG_DUMP)?,
            pg_dumpall: script("pg_dumpall", PG_DUMPALL)?,
            pg_restore: script("pg_restore", PG_RESTORE)?,
            pigz: script("pigz", PIGZ)?,
            ..ToolPaths::default()
        };
        Ok(Self { dir, tools })
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir.path().join("state")
    }

    fn touch(&self, name: &str) -> io::Result<()> {
        std::fs::write(self.state_dir().join(name), b"")
    }

    pub fn set_size(&self, db: &str, bytes: u64) -> io::Result<()> {
        std::fs::write(self.state_dir().join(format!("size_{}", db)), format!("{}\n", bytes))
    }

    pub fn set_superuser(&self, superuser: bool) -> io::Result<()> {
        std::fs::write(self.state_dir().join("superuser"), if superuser { "t\n" } else { "f\n" })
    }

    pub fn fail_dump(&self, db: &str) -> io::Result<()> {
        self.touch(&format!("fail_dump_{}", db))
    }

    pub fn fail_restore(&self, db: &str) -> io::Result<()> {
        self.touch(&format!("fail_restore_{}", db))
    }

    pub fn fail_globals(&self) -> io::Result<()> {
        self.touch("fail_globals")
    }

    pub fn with_large_objects(&self, db: &str) -> io::Result<()> {
        self.touch(&format!("lo_{}", db))
    }

    pub fn slow_restores(&self) -> io::Result<()> {
        self.touch("slow")
    }

    pub fn read_state(&self, name: &str) -> io::Result<String> {
        match std::fs::read_to_string(self.state_dir().join(name)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            other => other,
        }
    }

    pub fn sql_log(&self) -> io::Result<String> {
        self.read_state("sql.log")
    }

    pub fn restore_log(&self) -> io::Result<String> {
        self.read_state("restore.log")
    }

    /// Engine configuration pointing at the fake tools
    pub fn config(&self, backup_dir: &Path) -> Config {
        let mut config = Config::default();
        config.tools = self.tools.clone();
        config.backup.backup_dir = backup_dir.to_path_buf();
        config.backup.compressor_threads = 2;
        config.wal.archive_dir = backup_dir.join("wal");
        config.executor.kill_grace_secs = 1;
        config
    }

    pub fn adapter(&self) -> DatabaseAdapter {
        let config = self.config(self.dir.path());
        DatabaseAdapter::new(
            config.database,
            self.tools.clone(),
            PipelineExecutor::new(Duration::from_secs(1)),
            Duration::from_secs(30),
        )
    }

    /// Engine state over the fake tools with a roomy disk
    pub fn engine(&self, backup_dir: &Path) -> Arc<EngineState> {
        self.engine_with(self.config(backup_dir))
    }

    pub fn engine_with(&self, config: Config) -> Arc<EngineState> {
        Arc::new(EngineState::new(config).with_disk_probe(Box::new(RoomyDisk)))
    }
}
