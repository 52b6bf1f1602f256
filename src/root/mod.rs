use serde::{de::DeserializeOwned, Serialize};

use crate::fs::{DbDir, DbFile};

const ROOT: &str = "ROOT";
pub(crate) const ROOT_TMP: &str = "ROOT_TMP";

/// The single piece of metadata that says which files make up the database.
/// It is only ever replaced whole: written to a temporary file, synced, then
/// renamed over the previous version.
#[derive(Debug)]
pub struct Root<T, D>
where
    T: Serialize + DeserializeOwned + Default + Clone,
    D: DbDir,
{
    dir: D,
    pub(crate) data: T,
}

impl<T, D> Root<T, D>
where
    T: Serialize + DeserializeOwned + Default + Clone,
    D: DbDir,
{
    pub fn load(dir: D) -> anyhow::Result<Self> {
        match dir.open(&ROOT)? {
            Some(file) => {
                let contents = file.read_all()?;
                Ok(Self {
                    dir,
                    data: serde_json::from_slice(&contents)?,
                })
            }
            None => {
                let mut result = Self {
                    dir,
                    data: T::default(),
                };
                result.write(T::default())?;
                Ok(result)
            }
        }
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn write(&mut self, t: T) -> anyhow::Result<()> {
        // A leftover from an interrupted write is never read.
        self.dir.unlink(&ROOT_TMP)?;
        let mut file = match self.dir.create(&ROOT_TMP)? {
            Some(f) => f,
            None => anyhow::bail!("{} still exists after unlink", ROOT_TMP),
        };
        let encoded = serde_json::to_vec(&t)?;
        file.write(&encoded)?;
        file.sync()?;

        self.dir.rename(&ROOT_TMP, &ROOT)?;
        self.data = t;

        Ok(())
    }

    // Applies `f` to a copy of the current contents and persists the result.
    // On error the in-memory contents are left as they were.
    pub fn transform<F>(&mut self, f: F) -> anyhow::Result<()>
    where
        F: FnOnce(T) -> T,
    {
        let next = f(self.data.clone());
        self.write(next)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::Root;
    use crate::fs::{DbDir, MockDir};

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Layout {
        files: Vec<String>,
    }

    #[test]
    fn test_root_survives_reload() -> anyhow::Result<()> {
        let dir = MockDir::new();
        let mut root: Root<Layout, _> = Root::load(dir.clone())?;
        assert_eq!(root.data(), &Layout::default());

        root.transform(|mut l| {
            l.files.push("blk-1-0".into());
            l
        })?;

        let root: Root<Layout, _> = Root::load(dir.clone())?;
        assert_eq!(root.data().files, vec!["blk-1-0".to_owned()]);
        assert_eq!(dir.ls()?, vec!["ROOT".to_owned()]);
        Ok(())
    }

    #[test]
    fn test_failed_write_keeps_old_contents() -> anyhow::Result<()> {
        let dir = MockDir::new();
        let mut root: Root<Layout, _> = Root::load(dir.clone())?;
        root.transform(|mut l| {
            l.files.push("a".into());
            l
        })?;

        dir.fs.lock().schedule_crash(2);
        let res = root.transform(|mut l| {
            l.files.push("b".into());
            l
        });
        assert!(res.is_err());
        assert_eq!(root.data().files, vec!["a".to_owned()]);

        dir.fs.lock().reboot();
        let root: Root<Layout, _> = Root::load(dir)?;
        assert_eq!(root.data().files, vec!["a".to_owned()]);
        Ok(())
    }
}
