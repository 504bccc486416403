// Static pages served by the updater. Login is checked in the browser only.

pub const LOGIN_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>ESP32 Login</title>
    <style>
        body { font-family: Arial, sans-serif; background: #1a1a1a; color: #fff; }
        form { max-width: 320px; margin: 80px auto; background: #2a2a2a; padding: 24px; border-radius: 8px; }
        h1 { font-size: 20px; text-align: center; color: #4CAF50; }
        label { display: block; margin-top: 12px; }
        input { width: 100%; padding: 6px; margin-top: 4px; box-sizing: border-box; }
        input[type="submit"] { background: #4CAF50; color: #fff; border: none; margin-top: 20px; cursor: pointer; }
    </style>
</head>
<body>
    <form name="loginForm" onsubmit="return check(this)">
        <h1>Login Page</h1>
        <label>Username:<input type="text" name="userid"></label>
        <label>Password:<input type="password" name="pwd"></label>
        <input type="submit" value="Login">
    </form>
    <script>
        function check(form) {
            if (form.userid.value == 'admin' && form.pwd.value == 'admin') {
                window.open('/serverIndex');
            } else {
                alert('Error Password or Username');
            }
            return false;
        }
    </script>
</body>
</html>
"#;

pub const UPLOAD_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>ESP32 OTA Update</title>
    <style>
        body { font-family: Arial, sans-serif; max-width: 600px; margin: 50px auto; background: #1a1a1a; color: #fff; }
        .container { background: #2a2a2a; padding: 30px; border-radius: 10px; }
        h1 { color: #4CAF50; text-align: center; }
        .progress { width: 100%; height: 30px; background: #333; border-radius: 5px; overflow: hidden; margin: 20px 0; }
        .progress-bar { height: 100%; width: 0%; background: #4CAF50; text-align: center; line-height: 30px; }
        button { background: #4CAF50; color: #fff; padding: 10px 30px; border: none; border-radius: 5px; cursor: pointer; }
        button:disabled { background: #666; cursor: not-allowed; }
        #status { text-align: center; font-weight: bold; }
    </style>
</head>
<body>
    <div class="container">
        <h1>Firmware Update</h1>
        <form id="upload_form" method="POST" action="/update" enctype="multipart/form-data">
            <input type="file" name="update" accept=".bin">
            <button id="upload_btn" type="submit">Update</button>
        </form>
        <div class="progress"><div class="progress-bar" id="prg">0%</div></div>
        <div id="status"></div>
    </div>
    <script>
        const form = document.getElementById('upload_form');
        const bar = document.getElementById('prg');
        const status = document.getElementById('status');
        const button = document.getElementById('upload_btn');

        form.addEventListener('submit', function (e) {
            e.preventDefault();
            if (!form.update.files.length) {
                alert('Please select a firmware file');
                return;
            }
            const xhr = new XMLHttpRequest();
            xhr.open('POST', '/update');
            xhr.upload.addEventListener('progress', function (evt) {
                if (evt.lengthComputable) {
                    const per = Math.round(evt.loaded / evt.total * 100);
                    bar.style.width = per + '%';
                    bar.textContent = per + '%';
                }
            });
            xhr.onload = function () {
                if (xhr.responseText.trim() == 'OK') {
                    status.textContent = 'Update successful! Device will restart...';
                    status.style.color = '#4CAF50';
                } else {
                    status.textContent = 'Update failed, the current firmware keeps running';
                    status.style.color = '#f44336';
                    button.disabled = false;
                }
            };
            xhr.onerror = function () {
                status.textContent = 'Upload interrupted';
                status.style.color = '#f44336';
                button.disabled = false;
            };
            button.disabled = true;
            status.textContent = 'Uploading...';
            xhr.send(new FormData(form));
        });
    </script>
</body>
</html>
"#;
